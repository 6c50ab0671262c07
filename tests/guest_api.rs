//! `ApiClient` against an in-process mock of the guest REST API.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use osv_proxy::vm::{ApiClient, ApiError};

#[derive(Clone, Default)]
struct Guest {
    env: Arc<Mutex<BTreeMap<String, String>>>,
    apps: Arc<Mutex<Vec<String>>>,
    shut_down: Arc<AtomicBool>,
}

async fn uptime() -> &'static str {
    "42"
}

async fn env_all(State(guest): State<Guest>) -> String {
    let entries: Vec<String> = guest
        .env
        .lock()
        .unwrap()
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    serde_json::to_string(&entries).unwrap()
}

async fn env_get(State(guest): State<Guest>, Path(name): Path<String>) -> Result<String, StatusCode> {
    guest
        .env
        .lock()
        .unwrap()
        .get(&name)
        .map(|v| format!("\"{v}\""))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn env_set(
    State(guest): State<Guest>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    match query.get("val") {
        Some(val) => {
            guest.env.lock().unwrap().insert(name, val.clone());
            StatusCode::OK
        }
        None => StatusCode::BAD_REQUEST,
    }
}

async fn env_delete(State(guest): State<Guest>, Path(name): Path<String>) -> StatusCode {
    guest.env.lock().unwrap().remove(&name);
    StatusCode::OK
}

async fn app_run(State(guest): State<Guest>, Query(query): Query<HashMap<String, String>>) -> StatusCode {
    match query.get("command") {
        Some(cmd) => {
            guest.apps.lock().unwrap().push(cmd.clone());
            StatusCode::OK
        }
        None => StatusCode::BAD_REQUEST,
    }
}

async fn os_shutdown(State(guest): State<Guest>) -> StatusCode {
    guest.shut_down.store(true, Ordering::SeqCst);
    StatusCode::OK
}

async fn spawn_guest() -> (ApiClient, Guest) {
    let guest = Guest::default();
    guest
        .env
        .lock()
        .unwrap()
        .insert("OSV_VERSION".into(), "v0.24".into());

    let app = Router::new()
        .route("/os/uptime", get(uptime))
        .route("/os/shutdown", post(os_shutdown))
        .route("/env/", get(env_all))
        .route("/env/{name}", get(env_get).post(env_set).delete(env_delete))
        .route("/app/", put(app_run))
        .with_state(guest.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let api = ApiClient::new("127.0.0.1", port)
        .unwrap()
        .with_up_timeout(Duration::from_secs(5));
    (api, guest)
}

#[tokio::test]
async fn env_all_lists_guest_variables() {
    let (api, _guest) = spawn_guest().await;
    let env = api.env_all().await.unwrap();
    assert_eq!(env.get("OSV_VERSION").map(String::as_str), Some("v0.24"));
}

#[tokio::test]
async fn env_set_get_and_delete() {
    let (api, guest) = spawn_guest().await;

    api.env_set("var1", "asdf").await.unwrap();
    assert_eq!(api.env_get("var1").await.unwrap(), "asdf");

    api.env_set("var1", "sss\"ttrt").await.unwrap();
    assert_eq!(api.env_get("var1").await.unwrap(), "sss\"ttrt");

    api.env_set("var2", "a b&c=d").await.unwrap();
    assert_eq!(guest.env.lock().unwrap().get("var2").map(String::as_str), Some("a b&c=d"));

    api.env_delete("var1").await.unwrap();
    match api.env_get("var1").await {
        Err(ApiError::Status { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected 404, got {other:?}"),
    }
    // Deleting an unset variable still succeeds.
    api.env_delete("var1").await.unwrap();
}

#[tokio::test]
async fn listener_ports_are_exported_and_app_started() {
    let (api, guest) = spawn_guest().await;

    let copied = api
        .copy_all_env([
            ("OSV_PROXY_STDIN_PORT".to_string(), "2300".to_string()),
            ("OSV_PROXY_STDOUT_PORT".to_string(), "2301".to_string()),
        ])
        .await
        .unwrap();
    assert_eq!(copied, 2);

    api.app_run("/usr/lib/mpi_hello.so \"-np\" \"4\"").await.unwrap();
    assert_eq!(
        guest.apps.lock().unwrap().as_slice(),
        ["/usr/lib/mpi_hello.so \"-np\" \"4\"".to_string()]
    );
    assert_eq!(
        guest.env.lock().unwrap().get("OSV_PROXY_STDOUT_PORT").map(String::as_str),
        Some("2301")
    );

    assert!(matches!(api.app_run("").await, Err(ApiError::Parse(_))));
}

#[tokio::test]
async fn shutdown_reaches_guest() {
    let (api, guest) = spawn_guest().await;
    api.os_shutdown().await.unwrap();
    assert!(guest.shut_down.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unreachable_guest_times_out() {
    // Grab a free port and release it so nothing is listening there.
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let api = ApiClient::new("127.0.0.1", port)
        .unwrap()
        .with_up_timeout(Duration::from_millis(300));
    match api.env_all().await {
        Err(ApiError::NotReachable(base)) => assert!(base.contains(&port.to_string())),
        other => panic!("expected NotReachable, got {other:?}"),
    }
}
