use super::*;
use crate::Config;
use crate::broker::ToolPaths;
use crate::error::ApiError;
use crate::process::CommandOutput;
use crate::process::testing::{ScriptedRunner, arg_after};
use crate::types::Event;
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

/// Helper to create a broker over a scripted runner, with disk-space checks off
async fn create_test_broker(
    configure: impl FnOnce(&mut Config),
) -> (Arc<FetchBroker>, Arc<ScriptedRunner>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.output_dir = temp_dir.path().to_path_buf();
    config.admission.disk_space.enabled = false;
    configure(&mut config);

    let runner = Arc::new(ScriptedRunner::new());
    let tools = ToolPaths {
        fetch: PathBuf::from("yt-dlp"),
        archive: PathBuf::from("zip"),
    };
    let broker = FetchBroker::with_runner(config, tools, runner.clone())
        .await
        .unwrap();
    (Arc::new(broker), runner, temp_dir)
}

fn get(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn api_error(response: axum::response::Response) -> ApiError {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn probe_ok(runner: &ScriptedRunner, bytes: &[u64]) {
    runner.push(CommandOutput::success(bytes.iter().enumerate().map(|(i, b)| {
        format!("https://media.example/{i}\t{b}\tNA\tNA\tNA")
    })));
}

/// Fetch step writing `(name, content)` files into the `-P` directory
fn fetch_files(runner: &ScriptedRunner, files: &[(&str, &str)]) {
    let files: Vec<(String, String)> = files
        .iter()
        .map(|(n, c)| (n.to_string(), c.to_string()))
        .collect();
    runner.push_with(move |args| {
        let dir = PathBuf::from(arg_after(args, "-P").unwrap());
        let lines = files
            .iter()
            .map(|(name, content)| {
                let p = dir.join(name);
                std::fs::write(&p, content).unwrap();
                p.display().to_string()
            })
            .collect::<Vec<_>>();
        Ok(CommandOutput::success(lines))
    });
}

async fn wait_for_deletion(rx: &mut tokio::sync::broadcast::Receiver<Event>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::ArtifactsDeleted { .. } = rx.recv().await.unwrap() {
                return;
            }
        }
    })
    .await
    .expect("artifacts were not deleted");
}

fn entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (broker, _runner, _temp_dir) = create_test_broker(|_| {}).await;
    let app = create_router(broker);

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_cors_enabled() {
    let (broker, _runner, _temp_dir) = create_test_broker(|c| {
        c.api.cors_enabled = true;
        c.api.cors_origins = vec!["*".to_string()];
    })
    .await;
    let app = create_router(broker);

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin")
    );
}

#[tokio::test]
async fn test_cors_disabled() {
    let (broker, _runner, _temp_dir) = create_test_broker(|c| c.api.cors_enabled = false).await;
    let app = create_router(broker);

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert!(
        !response
            .headers()
            .contains_key("access-control-allow-origin")
    );
}

#[tokio::test]
async fn test_openapi_endpoint_with_swagger_enabled() {
    let (broker, _runner, _temp_dir) = create_test_broker(|c| c.api.swagger_ui = true).await;
    let app = create_router(broker);

    let response = app.oneshot(get("/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(json["paths"].get("/").is_some());
}

#[tokio::test]
async fn test_missing_url_is_bad_request_for_every_format() {
    let (broker, runner, _temp_dir) = create_test_broker(|_| {}).await;

    for uri in ["/", "/?format=audio", "/?format=video", "/?format=flac"] {
        let response = create_router(broker.clone()).oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");

        let error = api_error(response).await;
        assert_eq!(error.error.code, "validation_error");
        assert_eq!(error.error.details.unwrap()["rule"], "missing_url");
        assert!(error.error.message.contains("usage:"));
    }
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn test_unsupported_format_is_bad_request() {
    let (broker, runner, _temp_dir) = create_test_broker(|_| {}).await;

    for format in ["flac", "mp4", "AUDIO", ""] {
        let uri = format!("/?url=https://media.example/0&format={format}");
        let response = create_router(broker.clone()).oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{format:?}");
        assert_eq!(
            api_error(response).await.error.details.unwrap()["rule"],
            "unsupported_format"
        );
    }
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn test_unparsable_url_is_bad_request() {
    let (broker, runner, _temp_dir) = create_test_broker(|_| {}).await;
    let app = create_router(broker);

    let response = app
        .oneshot(get("/?url=https://media.example/0&url=not%20a%20url"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        api_error(response).await.error.details.unwrap()["rule"],
        "invalid_url"
    );
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn test_over_budget_is_forbidden_and_nothing_is_fetched() {
    let (broker, runner, temp_dir) =
        create_test_broker(|c| c.admission.max_request_bytes = 1_000_000).await;
    probe_ok(&runner, &[600_000, 600_000]);
    let app = create_router(broker);

    let response = app
        .oneshot(get(
            "/?url=https://media.example/0&url=https://media.example/1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let details = api_error(response).await.error.details.unwrap();
    assert_eq!(details["projected_bytes"], 1_200_000);
    assert_eq!(details["limit_bytes"], 1_000_000);
    assert_eq!(runner.call_count(), 1, "only the probe ran");
    assert_eq!(entries(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_single_file_is_streamed_then_deleted() {
    let (broker, runner, temp_dir) = create_test_broker(|_| {}).await;
    probe_ok(&runner, &[11]);
    fetch_files(&runner, &[("Talk_[xyz].mp3", "mp3 payload")]);
    let mut rx = broker.subscribe();
    let app = create_router(broker.clone());

    let response = app
        .oneshot(get("/?url=https%3A%2F%2Fmedia.example%2F0"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "application/octet-stream");
    assert_eq!(headers["content-length"], "11");
    let disposition = headers["content-disposition"].to_str().unwrap();
    assert!(disposition.starts_with("attachment; filename=\"Talk_[xyz].mp3\""));
    assert!(headers.contains_key("x-request-id"));

    // the request directory exists until the body has been consumed
    assert_eq!(entries(temp_dir.path()), 1);

    assert_eq!(body_bytes(response).await, b"mp3 payload");
    wait_for_deletion(&mut rx).await;

    assert_eq!(entries(temp_dir.path()), 0);
    assert!(broker.lifecycle().registry().is_empty());
}

#[tokio::test]
async fn test_multiple_files_are_bundled_and_all_deleted() {
    let (broker, runner, temp_dir) = create_test_broker(|_| {}).await;
    probe_ok(&runner, &[1, 1]);
    fetch_files(&runner, &[("one.mp4", "1"), ("two.mp4", "2")]);
    runner.push_with(|args| {
        std::fs::write(PathBuf::from(&args[2]), b"PK archive").unwrap();
        Ok(CommandOutput::success(Vec::<String>::new()))
    });
    let mut rx = broker.subscribe();
    let app = create_router(broker);

    let response = app
        .oneshot(get(
            "/?url=https://media.example/0&url=https://media.example/1&format=video",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(".zip"));

    let calls = runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].0, PathBuf::from("zip"));
    assert_eq!(arg_after(&calls[1].1, "-f").as_deref(), Some("bestvideo*+bestaudio/best"));

    assert_eq!(body_bytes(response).await, b"PK archive");
    wait_for_deletion(&mut rx).await;
    assert_eq!(entries(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_abandoned_response_still_deletes_artifacts() {
    let (broker, runner, temp_dir) = create_test_broker(|_| {}).await;
    probe_ok(&runner, &[3]);
    fetch_files(&runner, &[("clip.mp3", "abc")]);
    let mut rx = broker.subscribe();
    let app = create_router(broker);

    let response = app
        .oneshot(get("/?url=https://media.example/0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // client went away before reading the body
    drop(response);
    wait_for_deletion(&mut rx).await;
    assert_eq!(entries(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_fetch_failure_is_internal_error_without_diagnostics() {
    let (broker, runner, temp_dir) = create_test_broker(|_| {}).await;
    probe_ok(&runner, &[3]);
    runner.push(CommandOutput::failure(
        1,
        "ERROR: [generic] Unable to download webpage: /home/svc/cookies.txt",
    ));
    let mut rx = broker.subscribe();
    let app = create_router(broker);

    let response = app
        .oneshot(get("/?url=https://media.example/0"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let error = api_error(response).await;
    assert_eq!(error.error.code, "fetch_failed");
    assert!(!error.error.message.contains("cookies"));

    wait_for_deletion(&mut rx).await;
    assert_eq!(entries(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_probe_failure_is_internal_error() {
    let (broker, runner, _temp_dir) = create_test_broker(|_| {}).await;
    runner.push(CommandOutput::failure(1, "ERROR: Unsupported URL"));
    let app = create_router(broker);

    let response = app
        .oneshot(get("/?url=https://media.example/0"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(api_error(response).await.error.code, "probe_failed");
    assert_eq!(runner.call_count(), 1);
}

#[tokio::test]
async fn test_api_server_stops_on_shutdown() {
    let (broker, _runner, _temp_dir) =
        create_test_broker(|c| c.api.bind_address = "127.0.0.1:0".parse().unwrap()).await;

    let server = tokio::spawn(start_api_server(broker.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}
