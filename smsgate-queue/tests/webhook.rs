use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use chrono::Utc;
use pretty_assertions::assert_eq;
use smsgate_queue::{NotificationSink, SinkError, WebhookConfig, WebhookSink};
use smsgate_store::{NewNotification, Notification, NotificationKind, NotificationPriority};
use tokio::{net::TcpListener, sync::Mutex};

type Received = Arc<Mutex<Vec<serde_json::Value>>>;

async fn serve(status: StatusCode) -> (String, Received) {
    let received = Received::default();
    let app = Router::new()
        .route(
            "/hook",
            post(
                move |State(received): State<Received>, Json(body): Json<serde_json::Value>| async move {
                    received.lock().await.push(body);
                    status
                },
            ),
        )
        .with_state(received.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (format!("http://{addr}/hook"), received)
}

fn notification() -> Notification {
    Notification::from_new(
        NewNotification {
            kind: NotificationKind::ModemOffline,
            title: "Modem offline".into(),
            message: "Modem usb0 (/dev/ttyUSB0) is not responding".into(),
            priority: NotificationPriority::High,
            data: serde_json::json!({ "device_path": "/dev/ttyUSB0" }),
        },
        Utc::now(),
    )
}

#[tokio::test]
async fn posts_the_notification_as_json() {
    let (url, received) = serve(StatusCode::OK).await;
    let sink = WebhookSink::new(&WebhookConfig {
        url,
        timeout_secs: 5,
    })
    .expect("sink");

    sink.deliver(&notification()).await.expect("delivered");

    let received = received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["type"], "modem_offline");
    assert_eq!(received[0]["priority"], "high");
    assert_eq!(received[0]["data"]["device_path"], "/dev/ttyUSB0");
}

#[tokio::test]
async fn non_success_status_is_a_rejection() {
    let (url, _) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
    let sink = WebhookSink::new(&WebhookConfig {
        url,
        timeout_secs: 5,
    })
    .expect("sink");

    let err = sink.deliver(&notification()).await.expect_err("rejected");
    assert!(matches!(err, SinkError::Rejected { status: 500 }));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_error() {
    let sink = WebhookSink::new(&WebhookConfig {
        url: "http://127.0.0.1:1/hook".to_string(),
        timeout_secs: 2,
    })
    .expect("sink");

    let err = sink.deliver(&notification()).await.expect_err("unreachable");
    assert!(matches!(err, SinkError::Transport(_)));
}
