//! Email delivery against a minimal SMTP server that records each session.

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;
use smsgate_common::ManualClock;
use smsgate_queue::{
    EmailConfig, EmailSink, NotificationSink, NotificationTrigger, SinkError, SmtpSecurity,
};
use smsgate_store::{
    MemoryStore, NewNotification, Notification, NotificationKind, NotificationPriority,
    NotificationStore,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

#[derive(Debug, Default)]
struct Captured {
    commands: Vec<String>,
    messages: Vec<String>,
}

type Shared = Arc<Mutex<Captured>>;

/// Accepts every connection; `RCPT` is answered with `rcpt_code`.
async fn smtp_server(rcpt_code: u16) -> (u16, Shared) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let captured = Shared::default();
    let state = captured.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let state = state.clone();
            tokio::spawn(async move {
                let _ = session(stream, rcpt_code, state).await;
            });
        }
    });
    (port, captured)
}

async fn session(stream: TcpStream, rcpt_code: u16, state: Shared) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"220 mock ESMTP ready\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        let verb = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        state.lock().await.commands.push(line.clone());

        let reply = match verb.as_str() {
            "EHLO" | "HELO" => "250 mock\r\n".to_string(),
            "RCPT" if rcpt_code != 250 => format!("{rcpt_code} No such user here\r\n"),
            "DATA" => {
                write
                    .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                    .await?;
                let mut message = Vec::new();
                while let Some(line) = lines.next_line().await? {
                    if line == "." {
                        break;
                    }
                    message.push(line);
                }
                state.lock().await.messages.push(message.join("\n"));
                "250 OK: queued\r\n".to_string()
            }
            "QUIT" => {
                write.write_all(b"221 Bye\r\n").await?;
                return Ok(());
            }
            _ => "250 OK\r\n".to_string(),
        };
        write.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

fn config(port: u16, to: &[&str]) -> EmailConfig {
    EmailConfig {
        smtp_host: "127.0.0.1".into(),
        smtp_port: port,
        security: SmtpSecurity::Plain,
        username: None,
        password: None,
        from: "SMS Gateway <gateway@example.com>".into(),
        to: to.iter().map(ToString::to_string).collect(),
        timeout_secs: 5,
    }
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
async fn mails_every_recipient_with_gateway_headers() {
    let (port, captured) = smtp_server(250).await;
    let sink = EmailSink::new(&config(port, &["ops@example.com", "oncall@example.com"]))
        .expect("sink");

    sink.deliver(&notification()).await.expect("delivered");

    let captured = captured.lock().await;
    assert!(
        captured
            .commands
            .contains(&"MAIL FROM:<gateway@example.com>".to_string())
    );
    let recipients: Vec<_> = captured
        .commands
        .iter()
        .filter(|c| c.starts_with("RCPT"))
        .cloned()
        .collect();
    assert_eq!(
        recipients,
        vec!["RCPT TO:<ops@example.com>", "RCPT TO:<oncall@example.com>"]
    );

    assert_eq!(captured.messages.len(), 1);
    let message = &captured.messages[0];
    assert!(message.contains("Subject: [SMS Gateway] Modem offline"));
    assert!(message.contains("X-Mailer: SMS Gateway"));
    assert!(message.contains("Priority: 1"));
    assert!(message.contains("Content-Type: text/html"));
    assert!(message.contains("<h1>Modem offline</h1>"));
}

#[tokio::test]
async fn refused_recipient_is_a_transport_error() {
    let (port, captured) = smtp_server(550).await;
    let sink = EmailSink::new(&config(port, &["nobody@example.com"])).expect("sink");

    let err = sink
        .deliver(&notification())
        .await
        .expect_err("refused");
    assert!(matches!(err, SinkError::Transport(_)));
    assert!(captured.lock().await.messages.is_empty());
}

#[tokio::test]
async fn trigger_marks_mailed_notifications_processed() {
    let (port, captured) = smtp_server(250).await;
    let store = MemoryStore::new();
    let trigger = NotificationTrigger::new(
        Arc::new(store.clone()),
        Arc::new(ManualClock::default()),
    )
    .with_sink(Arc::new(EmailSink::new(&config(port, &[])).expect("sink")));

    let id = trigger.queue_blocked(150).await.expect("recorded");

    let stored = NotificationStore::get(&store, id).await.expect("get");
    assert!(stored.processed && !stored.failed);

    let captured = captured.lock().await;
    assert_eq!(captured.messages.len(), 1);
    assert!(captured.messages[0].contains("Priority: 3"));
    assert!(
        captured
            .commands
            .contains(&"RCPT TO:<gateway@example.com>".to_string())
    );
}
