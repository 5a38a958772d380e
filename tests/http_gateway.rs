//! HttpGateway against a canned local HTTP server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetjobs::gateway::{CreateJobRequest, HttpGateway, ListQuery};
use fleetjobs::task::{BackendId, ConnectionRef, CreateTaskParams, TaskKind, TaskStatus};
use fleetjobs::{Error, TaskGateway};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    target: String,
    body: String,
}

type Route = fn(&str, &str) -> (u16, String);

/// Serve `route` until the test ends; every request is recorded.
async fn serve(route: Route) -> (String, Arc<Mutex<Vec<Seen>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let (status, body) = route(&request.method, &request.target);
                log.lock().expect("log").push(request);
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), seen)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Seen {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.expect("read");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if n == 0 {
            break buf.len();
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.expect("read body");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    Seen {
        method: request_line.next().unwrap_or_default().to_string(),
        target: request_line.next().unwrap_or_default().to_string(),
        body: String::from_utf8_lossy(&buf[header_end..]).to_string(),
    }
}

async fn backend(route: Route) -> (HttpGateway, Arc<Mutex<Vec<Seen>>>) {
    let (url, seen) = serve(route).await;
    let gateway = HttpGateway::new(url, Duration::from_secs(5)).expect("gateway");
    (gateway, seen)
}

fn jobs_api(method: &str, target: &str) -> (u16, String) {
    let path = target.split('?').next().unwrap_or(target);
    match (method, path) {
        ("POST", "/api/jobs") => (201, r#"{"id":42}"#.to_string()),
        ("GET", "/api/jobs") => (
            200,
            r#"[
                {"id":42,"type":"collection","name":"dc1 collection","status":"running",
                 "progress":37.6,"createdAt":"2024-05-01 10:00:00","connectionId":7,
                 "connectionName":"dc1","vmCount":2,"collectedVMCount":1,
                 "currentStep":"collecting vm-2"},
                {"id":41,"type":"zombie","status":"completed","progress":100,
                 "completedAt":"2024-05-01T09:00:00Z","analysisResults":{"zombie":true}}
            ]"#
            .to_string(),
        ),
        ("GET", "/api/jobs/42") => (
            200,
            r#"{"id":42,"type":"collection","status":"failed","progress":50,"error":"vCenter unreachable"}"#
                .to_string(),
        ),
        ("POST", "/api/jobs/42/stop") => (200, "{}".to_string()),
        ("POST", "/api/jobs/42/retry") => (201, r#"{"id":43}"#.to_string()),
        ("DELETE", "/api/jobs/42") => (204, String::new()),
        ("GET", "/api/jobs/42/logs") => (
            200,
            r#"[{"timestamp":"2024-05-01T10:00:01Z","level":"info","message":"started"}]"#
                .to_string(),
        ),
        _ => (404, r#"{"error":"job not found"}"#.to_string()),
    }
}

#[tokio::test]
async fn create_posts_the_job_and_returns_its_id() {
    let (gateway, seen) = backend(jobs_api).await;
    let params = CreateTaskParams::new(TaskKind::Collection, ConnectionRef::new(7, "dc1"))
        .with_selection(["vm-1", "vm-2"]);

    let id = gateway
        .create_job(&CreateJobRequest::from(&params))
        .await
        .expect("create");
    assert_eq!(id, BackendId(42));

    let seen = seen.lock().expect("seen").clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].target, "/api/jobs");
    let body: serde_json::Value = serde_json::from_str(&seen[0].body).expect("json body");
    assert_eq!(body["type"], "collection");
    assert_eq!(body["connectionId"], 7);
    assert_eq!(body["selectedVMs"], serde_json::json!(["vm-1", "vm-2"]));
    assert_eq!(body["vmCount"], 2);
}

#[tokio::test]
async fn list_decodes_backend_records() {
    let (gateway, seen) = backend(jobs_api).await;

    let page = gateway
        .list_jobs(&ListQuery::first_page(100))
        .await
        .expect("list");
    assert_eq!(page.rejected, 0);
    let records = page.records;
    assert_eq!(records.len(), 2);

    let running = &records[0];
    assert_eq!(running.backend_id, BackendId(42));
    assert_eq!(running.status, TaskStatus::Running);
    assert_eq!(running.progress, 38);
    assert_eq!(running.connection.as_ref().map(|conn| conn.id), Some(7));
    assert_eq!(running.collected_vm_count, Some(1));
    assert_eq!(running.current_step.as_deref(), Some("collecting vm-2"));
    assert!(running.created_at.is_some());
    assert!(running.selection.is_none());

    let finished = &records[1];
    assert_eq!(finished.kind, TaskKind::AnalysisZombie);
    assert_eq!(finished.status, TaskStatus::Completed);
    assert!(finished.completed_at.is_some());
    assert!(finished.connection.is_none());

    let target = seen.lock().expect("seen")[0].target.clone();
    assert!(target.contains("limit=100"), "query missing: {target}");
    assert!(target.contains("offset=0"), "query missing: {target}");
}

#[tokio::test]
async fn job_actions_hit_their_routes() {
    let (gateway, seen) = backend(jobs_api).await;
    let id = BackendId(42);

    let record = gateway.get_job(id).await.expect("get");
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("vCenter unreachable"));

    gateway.stop_job(id).await.expect("stop");
    assert_eq!(gateway.retry_job(id).await.expect("retry"), BackendId(43));
    gateway.delete_job(id).await.expect("delete");

    let logs = gateway.get_job_logs(id, 20).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "started");

    let routes: Vec<(String, String)> = seen
        .lock()
        .expect("seen")
        .iter()
        .map(|req| (req.method.clone(), req.target.clone()))
        .collect();
    assert_eq!(
        routes,
        vec![
            ("GET".to_string(), "/api/jobs/42".to_string()),
            ("POST".to_string(), "/api/jobs/42/stop".to_string()),
            ("POST".to_string(), "/api/jobs/42/retry".to_string()),
            ("DELETE".to_string(), "/api/jobs/42".to_string()),
            ("GET".to_string(), "/api/jobs/42/logs?limit=20".to_string()),
        ]
    );
}

#[tokio::test]
async fn non_success_status_is_a_remote_error() {
    let (gateway, _) = backend(jobs_api).await;

    let err = gateway.get_job(BackendId(7)).await.expect_err("missing");
    match err {
        Error::Remote(message) => {
            assert!(message.starts_with("404"), "unexpected message: {message}");
            assert!(message.contains("job not found"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_records_are_dropped_without_failing_the_listing() {
    fn mixed(_: &str, _: &str) -> (u16, String) {
        (
            200,
            r#"[
                {"id":3,"type":"collection","status":"analyzing","progress":80},
                {"id":2,"type":"collection","status":"exploded"},
                {"id":1,"type":"collection","status":"collecting","progress":12.2}
            ]"#
            .to_string(),
        )
    }
    let (gateway, _) = backend(mixed).await;

    let page = gateway
        .list_jobs(&ListQuery::first_page(10))
        .await
        .expect("list");
    assert_eq!(page.rejected, 1);
    let listed: Vec<_> = page
        .records
        .iter()
        .map(|record| (record.backend_id, record.status, record.progress))
        .collect();
    assert_eq!(
        listed,
        vec![
            (BackendId(3), TaskStatus::Running, 80),
            (BackendId(1), TaskStatus::Running, 12),
        ]
    );
}
