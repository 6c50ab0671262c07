//! Client for the guest's REST control API.
//!
//! Most calls carry their arguments in the query string rather than in a
//! body. Every call first makes sure the API is answering at all; that check
//! is done once per client.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use super::error::ApiError;

/// How long [`ApiClient::wait_up`] keeps retrying by default.
pub const DEFAULT_UP_TIMEOUT: Duration = Duration::from_secs(30);
const UP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    up: Arc<AtomicBool>,
    up_timeout: Duration,
}

impl ApiClient {
    pub fn new(ip: &str, port: u16) -> Result<Self, ApiError> {
        let base = Url::parse(&format!("http://{ip}:{port}/"))
            .map_err(|err| ApiError::Parse(format!("guest address {ip}:{port}: {err}")))?;
        // The guest sits on a local bridge, never behind an HTTP proxy.
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            base,
            up: Arc::new(AtomicBool::new(false)),
            up_timeout: DEFAULT_UP_TIMEOUT,
        })
    }

    pub fn with_up_timeout(mut self, timeout: Duration) -> Self {
        self.up_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Wait until `GET /os/uptime` gets any answer.
    pub async fn wait_up(&self) -> Result<(), ApiError> {
        if self.up.load(Ordering::Acquire) {
            return Ok(());
        }
        let url = self.url(&["os", "uptime"]);
        let deadline = tokio::time::Instant::now() + self.up_timeout;
        loop {
            match self.http.get(url.clone()).send().await {
                Ok(resp) => {
                    info!(base = %self.base, status = resp.status().as_u16(), "Guest API is up");
                    self.up.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(err) => debug!(base = %self.base, %err, "Guest API not up yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ApiError::NotReachable(self.base.to_string()));
            }
            tokio::time::sleep(UP_POLL_INTERVAL).await;
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // http URLs always have a path.
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear().extend(segments);
        }
        url
    }

    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<String, ApiError> {
        self.wait_up().await?;
        let mut url = self.url(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        debug!(%method, %url, "Guest API call");
        let resp = self.http.request(method, url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status != StatusCode::OK {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    // --- /env ---

    /// All guest environment variables.
    pub async fn env_all(&self) -> Result<HashMap<String, String>, ApiError> {
        let body = self.call(Method::GET, &["env", ""], &[]).await?;
        parse_env_list(&body)
    }

    pub async fn env_get(&self, name: &str) -> Result<String, ApiError> {
        let body = self.call(Method::GET, &["env", name], &[]).await?;
        // The value comes back as a quoted string.
        Ok(body.trim_matches('"').to_string())
    }

    pub async fn env_set(&self, name: &str, value: &str) -> Result<(), ApiError> {
        self.call(Method::POST, &["env", name], &[("val", value)]).await?;
        Ok(())
    }

    /// Succeeds whether or not the variable was set.
    pub async fn env_delete(&self, name: &str) -> Result<(), ApiError> {
        self.call(Method::DELETE, &["env", name], &[]).await?;
        Ok(())
    }

    /// Copy every `(name, value)` pair into the guest environment. Returns
    /// how many were copied.
    pub async fn copy_all_env<I>(&self, vars: I) -> Result<usize, ApiError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut copied = 0;
        for (name, value) in vars {
            info!(%name, %value, "Copying env");
            self.env_set(&name, &value).await?;
            copied += 1;
        }
        Ok(copied)
    }

    // --- /app, /os ---

    /// Start `command` (a guest `.so` path plus arguments).
    pub async fn app_run(&self, command: &str) -> Result<(), ApiError> {
        if command.is_empty() {
            warn!("Refusing to run an empty guest command");
            return Err(ApiError::Parse("empty guest command".into()));
        }
        self.call(Method::PUT, &["app", ""], &[("command", command)]).await?;
        info!(command, "Guest app started");
        Ok(())
    }

    pub async fn os_shutdown(&self) -> Result<(), ApiError> {
        self.call(Method::POST, &["os", "shutdown"], &[]).await?;
        Ok(())
    }
}

/// Split `"key=value"` at the first `=`. A line without `=` is all key.
pub fn env_var_split(line: &str) -> (&str, &str) {
    line.split_once('=').unwrap_or((line, ""))
}

/// Parse the `/env/` listing, a list literal of `"key=value"` strings.
pub fn parse_env_list(body: &str) -> Result<HashMap<String, String>, ApiError> {
    let entries: Vec<String> = serde_json::from_str(body.trim())
        .map_err(|err| ApiError::Parse(format!("{err}: {body}")))?;
    Ok(entries
        .iter()
        .map(|entry| {
            let (k, v) = env_var_split(entry);
            (k.to_string(), v.to_string())
        })
        .collect())
}

/// Quote trailing launcher arguments for the guest command line:
/// `["a", "b c"]` becomes `"a" "b c"`.
pub fn quote_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| format!("\"{}\"", a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
