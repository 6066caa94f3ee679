//! Live channel over a real WebSocket connection.

mod helpers;

use futures::{SinkExt, StreamExt};
use helpers::{host_router, TestApp};
use tokio_tungstenite::tungstenite::Message;

/// Read frames until one of the given type arrives or the deadline passes.
async fn next_frame_of_type(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    wanted: &str,
) -> Option<serde_json::Value> {
    let deadline = std::time::Duration::from_secs(3);
    let fut = async {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                let envelope: serde_json::Value = serde_json::from_str(text.as_str()).ok()?;
                if envelope["type"] == wanted {
                    return Some(envelope);
                }
            }
        }
        None
    };
    tokio::time::timeout(deadline, fut).await.ok().flatten()
}

#[tokio::test]
async fn subscribed_client_receives_only_its_channels() {
    let app = TestApp::new();

    // Serve the same instrumented app on a real listener for the upgrade.
    let served = app.pulse.instrument(host_router());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, served).await.unwrap();
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/pulse/ws/live"))
        .await
        .expect("websocket upgrade");

    // Subscribe to the error channel only, and give the reader loop a
    // moment to apply it.
    ws.send(Message::Text(
        serde_json::json!({"channels": ["error"]}).to_string().into(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // One request event (filtered out) and one error event (delivered).
    app.get("/users/1").await;
    app.get("/fail").await;

    let envelope = next_frame_of_type(&mut ws, "error")
        .await
        .expect("error frame delivered");
    assert_eq!(envelope["payload"]["route"], "/fail");
    assert_eq!(envelope["payload"]["type"], "validation");
    assert_eq!(envelope["payload"]["message"], "validation failed");
    assert_eq!(envelope["payload"]["count"], 1);
    assert!(envelope["timestamp"].is_string());

    // No request frame ever arrived ahead of the error frame, and none is
    // buffered behind it.
    let extra = tokio::time::timeout(std::time::Duration::from_millis(300), ws.next()).await;
    assert!(
        extra.is_err() || matches!(extra, Ok(Some(Ok(Message::Ping(_))))),
        "only ping frames may follow"
    );

    ws.close(None).await.ok();
    server.abort();
    app.pulse.shutdown().await;
}

#[tokio::test]
async fn unfiltered_client_receives_request_events() {
    let app = TestApp::new();

    let served = app.pulse.instrument(host_router());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, served).await.unwrap();
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/pulse/ws/live"))
        .await
        .expect("websocket upgrade");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    app.get("/users/9").await;

    let envelope = next_frame_of_type(&mut ws, "request")
        .await
        .expect("request frame delivered");
    assert_eq!(envelope["payload"]["method"], "GET");
    assert_eq!(envelope["payload"]["path"], "/users/{id}");
    assert_eq!(envelope["payload"]["status"], 200);
    assert_eq!(
        envelope["payload"]["trace_id"].as_str().unwrap().len(),
        32
    );

    ws.close(None).await.ok();
    server.abort();
    app.pulse.shutdown().await;
}
