//! SMTP delivery via lettre.
//!
//! The transport is built on first send and reused afterwards. lettre's
//! blocking transport runs on the blocking pool so a slow relay never
//! stalls the request workers.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use parking_lot::Mutex;

use super::{Notifier, NotifyError, Template};

/// Connection settings for an SMTP relay.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

pub struct SmtpNotifier {
    settings: SmtpSettings,
    from: Mailbox,
    transport: Mutex<Option<SmtpTransport>>,
}

impl SmtpNotifier {
    /// Validates the sender address; no connection is made yet.
    pub fn new(settings: SmtpSettings) -> Result<Self, NotifyError> {
        let from = settings
            .from
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::Address(format!("{}: {e}", settings.from)))?;
        Ok(Self {
            settings,
            from,
            transport: Mutex::new(None),
        })
    }

    /// Whether the transport has been built.
    pub fn is_connected(&self) -> bool {
        self.transport.lock().is_some()
    }

    fn transport(&self) -> Result<SmtpTransport, NotifyError> {
        let mut slot = self.transport.lock();
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }

        let mut builder = SmtpTransport::starttls_relay(&self.settings.host)
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .port(self.settings.port);
        if let (Some(user), Some(pass)) = (&self.settings.username, &self.settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let transport = builder.build();
        tracing::info!(host = %self.settings.host, port = self.settings.port, "smtp transport initialized");
        *slot = Some(transport.clone());
        Ok(transport)
    }

    fn build_message(&self, to: &str, template: &Template) -> Result<Message, NotifyError> {
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::Address(format!("{to}: {e}")))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(template.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(template.body())
            .map_err(|e| NotifyError::Build(e.to_string()))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, to: &str, template: &Template) -> Result<(), NotifyError> {
        let message = self.build_message(to, template)?;
        let transport = self.transport()?;
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| NotifyError::Transport(format!("send task failed: {e}")))?
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.transport.lock().take().is_some() {
            tracing::info!("smtp transport closed");
        }
    }
}
