// Socket sessions against a real listener
// Run with: cargo test -p genrelay-server --test ws_test

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use genrelay_server::{Pipeline, PipelineDeps, ServerConfig};
use genrelay_worker::NoopBinder;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn serve(config: ServerConfig) -> (Pipeline, SocketAddr) {
    let deps = PipelineDeps::local().with_binder(Arc::new(NoopBinder));
    let pipeline = Pipeline::start(config, deps)
        .await
        .expect("Failed to start pipeline");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("local addr");
    let app = pipeline.router();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("Server failed");
    });
    (pipeline, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("Failed to connect");
    client
}

/// Next JSON event, skipping control frames
async fn next_event(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(EVENT_TIMEOUT, client.next())
            .await
            .expect("Timed out waiting for event")
            .expect("Socket closed")
            .expect("Socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("event is JSON");
        }
    }
}

async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string()))
        .await
        .expect("Failed to send");
}

#[tokio::test]
async fn test_socket_job_gets_result_and_frame() {
    let (pipeline, addr) = serve(ServerConfig::default()).await;
    let mut client = connect(addr).await;

    let status = next_event(&mut client).await;
    assert_eq!(status["event"], "status");
    assert_eq!(status["metrics"]["frames"], true);

    send_text(
        &mut client,
        &json!({"event": "generate", "request": {"type": "manual"}}).to_string(),
    )
    .await;

    let job = next_event(&mut client).await;
    assert_eq!(job["event"], "job");
    let job_id = job["jobId"].as_str().expect("job id").to_string();

    // The result and its broadcast frame race each other
    let mut result = None;
    let mut frame = None;
    while result.is_none() || frame.is_none() {
        let event = next_event(&mut client).await;
        match event["event"].as_str() {
            Some("result") => result = Some(event),
            Some("frame") => frame = Some(event),
            _ => {}
        }
    }

    let result = result.expect("result event");
    assert_eq!(result["jobId"], job_id.as_str());
    assert_eq!(result["success"], true);
    assert_eq!(result["payload"]["request"]["type"], "manual");

    let frame = frame.expect("frame event");
    assert_eq!(frame["jobId"], job_id.as_str());
    assert_eq!(frame["payload"]["request"]["type"], "manual");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_keeps_session_open() {
    let (pipeline, addr) = serve(ServerConfig::default()).await;
    let mut client = connect(addr).await;
    assert_eq!(next_event(&mut client).await["event"], "status");

    send_text(&mut client, "{not json").await;
    let error = next_event(&mut client).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["error"], "invalid_request");
    assert!(error.get("jobId").is_none());

    send_text(&mut client, r#"{"event": "generate"}"#).await;
    let job = next_event(&mut client).await;
    assert_eq!(job["event"], "job");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let (pipeline, addr) = serve(ServerConfig::default()).await;
    let mut client = connect(addr).await;
    assert_eq!(next_event(&mut client).await["event"], "status");

    pipeline.cancellation().cancel();

    let closed = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "session stayed open after shutdown");

    pipeline.shutdown().await;
}
