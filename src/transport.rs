//! Outbound transports.
//!
//! `SmtpMailer` sends through `lettre` on a blocking thread. `LogOnlyTransport`
//! is used when SMTP is not configured: it logs each message and reports
//! success, so send records still accrue on development boxes.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MessageBuilder};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as _};
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::campaign::EmailFormat;
use crate::config::SmtpConfig;
use crate::error::TransportError;

/// A fully rendered email ready to transmit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingEmail {
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub format: EmailFormat,
}

/// Something that can deliver an [`OutgoingEmail`].
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError>;
}

fn mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Build the lettre message for `email`.
pub fn build_message(email: &OutgoingEmail) -> Result<Message, TransportError> {
    if email.to.is_empty() && email.cc.is_empty() && email.bcc.is_empty() {
        return Err(TransportError::NoRecipients);
    }

    let mut builder: MessageBuilder = Message::builder()
        .from(mailbox(&email.sender)?)
        .subject(email.subject.as_str());
    for address in &email.to {
        builder = builder.to(mailbox(address)?);
    }
    for address in &email.cc {
        builder = builder.cc(mailbox(address)?);
    }
    for address in &email.bcc {
        builder = builder.bcc(mailbox(address)?);
    }
    for address in &email.reply_to {
        builder = builder.reply_to(mailbox(address)?);
    }

    let content_type = match email.format {
        EmailFormat::Text => ContentType::TEXT_PLAIN,
        EmailFormat::Html => ContentType::TEXT_HTML,
    };
    builder
        .header(content_type)
        .body(email.body.clone())
        .map_err(|e| TransportError::Build(e.to_string()))
}

/// SMTP transport.
pub struct SmtpMailer {
    transport: SmtpTransport,
    host: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| TransportError::Build(format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            host: config.host.clone(),
        })
    }
}

#[async_trait]
impl Transport for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        let message = build_message(email)?;
        let transport = self.transport.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| TransportError::SendFailed(format!("SMTP task failed: {e}")))?
            .map_err(|e| TransportError::SendFailed(format!("SMTP send failed: {e}")))?;

        tracing::info!(host = %self.host, to = ?email.to, subject = %email.subject, "Email sent");
        Ok(())
    }
}

/// Transport used when SMTP is not configured.
#[derive(Debug, Default)]
pub struct LogOnlyTransport;

#[async_trait]
impl Transport for LogOnlyTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        build_message(email)?;
        tracing::info!(
            from = %email.sender,
            to = ?email.to,
            subject = %email.subject,
            "SMTP not configured, email logged instead of sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> OutgoingEmail {
        OutgoingEmail {
            sender: "MAGFest Registration <regdesk@example.com>".into(),
            to: vec!["ada@example.com".into()],
            cc: vec![],
            bcc: vec!["archive@example.com".into()],
            reply_to: vec![],
            subject: "Welcome".into(),
            body: "<p>Hi</p>".into(),
            format: EmailFormat::Html,
        }
    }

    #[test]
    fn builds_html_message() {
        let message = build_message(&email()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Welcome"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn rejects_bad_address() {
        let mut bad = email();
        bad.to = vec!["not an address".into()];
        assert!(matches!(
            build_message(&bad),
            Err(TransportError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn rejects_no_recipients() {
        let mut none = email();
        none.to.clear();
        none.bcc.clear();
        assert!(matches!(build_message(&none), Err(TransportError::NoRecipients)));
    }

    #[tokio::test]
    async fn log_transport_accepts_valid_email() {
        assert!(LogOnlyTransport.send(&email()).await.is_ok());
    }
}
