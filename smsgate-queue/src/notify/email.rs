use std::{fmt, time::Duration};

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message as Email, Tokio1Executor,
    message::{
        Mailbox,
        header::{ContentType, HeaderName, HeaderValue},
    },
    transport::smtp::authentication::Credentials,
};
use serde::Deserialize;
use smsgate_store::{Notification, NotificationPriority};

use super::{NotificationSink, SinkError};

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS (port 587).
    #[default]
    StartTls,
    /// TLS from the first byte (port 465).
    Tls,
    /// No encryption. Only for a relay on localhost.
    Plain,
}

/// ```ron
/// email: Some((
///     smtp_host: "smtp.example.com",
///     username: Some("gateway"),
///     password: Some("secret"),
///     from: "SMS Gateway <gateway@example.com>",
///     to: ["ops@example.com"],
/// )),
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub security: SmtpSecurity,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    pub from: String,

    /// Recipients. Empty sends to `from`.
    #[serde(default)]
    pub to: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .field("to", &self.to)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

const fn default_smtp_port() -> u16 {
    587
}

const fn default_timeout_secs() -> u64 {
    10
}

/// Mails each notification as an HTML message.
#[derive(Clone)]
pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl fmt::Debug for EmailSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailSink")
            .field("from", &self.from.to_string())
            .field("to", &self.to.len())
            .finish_non_exhaustive()
    }
}

fn mailbox(address: &str) -> Result<Mailbox, SinkError> {
    address
        .parse()
        .map_err(|e| SinkError::Other(format!("invalid address '{address}': {e}")))
}

impl EmailSink {
    /// # Errors
    /// Returns [`SinkError`] when an address does not parse or the TLS
    /// transport cannot be set up.
    pub fn new(config: &EmailConfig) -> Result<Self, SinkError> {
        let from = mailbox(&config.from)?;
        let to = if config.to.is_empty() {
            vec![from.clone()]
        } else {
            config
                .to
                .iter()
                .map(|address| mailbox(address))
                .collect::<Result<_, _>>()?
        };

        let host = config.smtp_host.as_str();
        let mut builder = match config.security {
            SmtpSecurity::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| SinkError::Transport(e.to_string()))?,
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| SinkError::Transport(e.to_string()))?,
            SmtpSecurity::Plain => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        }
        .port(config.smtp_port)
        .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    fn compose(&self, notification: &Notification) -> Result<Email, SinkError> {
        let priority = match notification.priority {
            NotificationPriority::High => "1",
            NotificationPriority::Medium | NotificationPriority::Low => "3",
        };

        let mut builder = Email::builder()
            .from(self.from.clone())
            .reply_to(self.from.clone())
            .subject(format!("[SMS Gateway] {}", notification.title))
            .header(ContentType::TEXT_HTML)
            .raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str("X-Mailer"),
                "SMS Gateway".to_string(),
            ))
            .raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str("Priority"),
                priority.to_string(),
            ));
        for to in &self.to {
            builder = builder.to(to.clone());
        }

        builder
            .body(html_body(notification))
            .map_err(|e| SinkError::Other(format!("unable to build email: {e}")))
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), SinkError> {
        let email = self.compose(notification)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(())
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn html_body(notification: &Notification) -> String {
    let title = escape_html(&notification.title);
    let message = escape_html(&notification.message).replace('\n', "<br>\n");
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><meta charset=\"UTF-8\"><title>{title}</title></head>\n\
         <body style=\"font-family: Arial, sans-serif;\">\n\
         <h1>{title}</h1>\n\
         <p>{message}</p>\n\
         <p><strong>Priority:</strong> {priority}<br>\n\
         <strong>Time:</strong> {created_at}</p>\n\
         <p style=\"color: #999; font-size: 12px;\">SMS Gateway automatic notification</p>\n\
         </body>\n\
         </html>\n",
        priority = notification.priority,
        created_at = notification.created_at.to_rfc3339(),
    )
}
