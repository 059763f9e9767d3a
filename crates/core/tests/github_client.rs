use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::IntoResponse;
use package_backup_core::{
    Error, GitHubClient, GitHubClientConfig, RecordingSettle, RepositoryHost, RepositoryStatus,
};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

type Handler = dyn Fn(&Recorded) -> (u16, String) + Send + Sync;

struct StubState {
    handler: Box<Handler>,
    requests: Mutex<Vec<Recorded>>,
}

/// Loopback API stand-in that records every request and answers through
/// `handler`. A handler status of 0 means "never answer".
struct StubServer {
    base_url: String,
    state: Arc<StubState>,
}

impl StubServer {
    async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded) -> (u16, String) + Send + Sync + 'static,
    {
        let state = Arc::new(StubState {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(respond)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn respond(
    State(state): State<Arc<StubState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let request = Recorded {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body,
    };
    let (status, response_body) = (state.handler)(&request);
    state.requests.lock().unwrap().push(request);

    if status == 0 {
        std::future::pending::<()>().await;
    }
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        response_body,
    )
}

fn client(base_url: &str) -> GitHubClient {
    client_with(base_url, Duration::ZERO, Duration::from_secs(5))
}

fn client_with(base_url: &str, settle_delay: Duration, timeout: Duration) -> GitHubClient {
    GitHubClient::new(GitHubClientConfig {
        api_base_url: base_url.to_string(),
        username: "octocat".to_string(),
        token: "ghp_test".to_string(),
        user_agent: "Package-Backup-Tool".to_string(),
        repository_description: "Package Backup".to_string(),
        settle_delay,
        timeout,
    })
    .unwrap()
}

async fn creating_server() -> StubServer {
    let created = Arc::new(AtomicBool::new(false));
    StubServer::start(move |req| match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/repos/octocat/foo-backup") if created.load(Ordering::SeqCst) => {
            (200, "{\"name\":\"foo-backup\"}".to_string())
        }
        ("GET", "/repos/octocat/foo-backup") => (404, "{\"message\":\"Not Found\"}".to_string()),
        ("POST", "/user/repos") => {
            created.store(true, Ordering::SeqCst);
            (201, "{\"name\":\"foo-backup\"}".to_string())
        }
        _ => (500, "{}".to_string()),
    })
    .await
}

#[tokio::test]
async fn missing_repository_is_created_private_and_initialized() {
    let server = creating_server().await;
    let client = client(&server.base_url);

    let status = client.ensure_repository("foo-backup").await.unwrap();
    assert_eq!(status, RepositoryStatus::Created);

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/repos/octocat/foo-backup");
    assert_eq!(requests[1].method, "POST");
    assert_eq!(requests[1].path, "/user/repos");

    for req in &requests {
        assert_eq!(
            req.headers.get("authorization").map(String::as_str),
            Some("token ghp_test")
        );
        assert_eq!(
            req.headers.get("user-agent").map(String::as_str),
            Some("Package-Backup-Tool")
        );
        assert_eq!(
            req.headers.get("accept").map(String::as_str),
            Some("application/vnd.github.v3+json")
        );
    }

    let body: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(body["name"], "foo-backup");
    assert_eq!(body["description"], "Package Backup");
    assert_eq!(body["private"], true);
    assert_eq!(body["auto_init"], true);
}

#[tokio::test]
async fn second_ensure_finds_repository_without_creating() {
    let server = creating_server().await;
    let client = client(&server.base_url);

    assert_eq!(
        client.ensure_repository("foo-backup").await.unwrap(),
        RepositoryStatus::Created
    );
    assert_eq!(
        client.ensure_repository("foo-backup").await.unwrap(),
        RepositoryStatus::Exists
    );

    let posts = server
        .requests()
        .iter()
        .filter(|r| r.method == "POST")
        .count();
    assert_eq!(posts, 1);
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn creation_failure_carries_provider_message() {
    let server = StubServer::start(|req| match req.method.as_str() {
        "GET" => (404, "{\"message\":\"Not Found\"}".to_string()),
        _ => (
            422,
            "{\"message\":\"name already exists on this account\"}".to_string(),
        ),
    })
    .await;

    let err = client(&server.base_url)
        .ensure_repository("foo-backup")
        .await
        .unwrap_err();
    match err {
        Error::Repository { message } => {
            assert!(message.contains("name already exists on this account"), "{message}");
            assert!(!message.contains("ghp_test"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_check_status_fails_without_creating() {
    let server = StubServer::start(|_| (500, "{\"message\":\"boom\"}".to_string())).await;

    let err = client(&server.base_url)
        .ensure_repository("foo-backup")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Repository { .. }));
    assert!(err.retryable());
    assert!(server.requests().iter().all(|r| r.method == "GET"));
}

#[tokio::test]
async fn settle_runs_once_after_creation_only() {
    let server = creating_server().await;
    let settle = Arc::new(RecordingSettle::new());
    let client = client_with(
        &server.base_url,
        Duration::from_secs(2),
        Duration::from_secs(5),
    )
    .with_settle(settle.clone());

    client.ensure_repository("foo-backup").await.unwrap();
    assert_eq!(settle.calls.load(Ordering::Relaxed), 1);
    assert_eq!(settle.delays().await, vec![Duration::from_secs(2)]);

    client.ensure_repository("foo-backup").await.unwrap();
    assert_eq!(settle.calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn zero_settle_delay_skips_the_wait() {
    let server = creating_server().await;
    let settle = Arc::new(RecordingSettle::new());
    let client = client(&server.base_url).with_settle(settle.clone());

    assert_eq!(
        client.ensure_repository("foo-backup").await.unwrap(),
        RepositoryStatus::Created
    );
    assert_eq!(settle.calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn unresponsive_api_times_out() {
    let server = StubServer::start(|_| (0, String::new())).await;
    let client = client_with(&server.base_url, Duration::ZERO, Duration::from_millis(200));

    let err = client.ensure_repository("foo-backup").await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
}

#[tokio::test]
async fn auth_check_reports_status_without_failing() {
    let ok = StubServer::start(|req| match req.path.as_str() {
        "/user" => (200, "{\"login\":\"octocat\"}".to_string()),
        _ => (404, "{}".to_string()),
    })
    .await;
    assert!(client(&ok.base_url).test_auth().await);
    assert_eq!(ok.requests()[0].path, "/user");

    let denied = StubServer::start(|_| (401, "{\"message\":\"Bad credentials\"}".to_string())).await;
    assert!(!client(&denied.base_url).test_auth().await);

    let unreachable = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };
    assert!(!client(&unreachable).test_auth().await);
}
