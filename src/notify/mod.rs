//! Outbound email. Requests never talk to a [`Notifier`] directly: they enqueue
//! an [`EmailMessage`] in the [`outbox::Outbox`], and the outbox worker hands
//! it to the notifier, retrying with backoff on failure.

pub mod outbox;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailMessage {
    pub fn verification(to: &str, link: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Email Verification".into(),
            body: format!("Please verify your email by clicking the following link: {link}"),
        }
    }

    pub fn password_reset(to: &str, link: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: "Password Reset".into(),
            body: format!("Please reset your password by clicking the following link: {link}"),
        }
    }
}

/// Delivery backend used by the outbox worker.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message or return an error to have it retried.
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Development notifier: logs the message instead of sending it.
#[derive(Clone, Debug)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        info!(
            to = %message.to,
            subject = %message.subject,
            body = %message.body,
            "email delivery stub"
        );
        Ok(())
    }
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(cfg: &MailConfig) -> anyhow::Result<Self> {
        let builder = if cfg.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
                .with_context(|| format!("smtp relay {}", cfg.host))?
        } else {
            let tls = TlsParameters::new(cfg.host.clone()).context("smtp tls parameters")?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host)
                .tls(Tls::Opportunistic(tls))
        };
        let mut builder = builder
            .port(cfg.port)
            .timeout(Some(Duration::from_secs(cfg.timeout_secs)));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let from = cfg
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("invalid sender address {}", cfg.from))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        let to = message
            .to
            .parse::<Mailbox>()
            .with_context(|| format!("invalid recipient {}", message.to))?;
        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .context("build email")?;
        self.transport.send(email).await.context("smtp send")?;
        Ok(())
    }
}

pub fn build_notifier(mail: Option<&MailConfig>) -> anyhow::Result<Arc<dyn Notifier>> {
    match mail {
        Some(cfg) => {
            info!(host = %cfg.host, port = cfg.port, secure = cfg.secure, "smtp notifier");
            Ok(Arc::new(SmtpNotifier::new(cfg)?))
        }
        None => {
            info!("EMAIL_HOST not set; emails will be logged, not sent");
            Ok(Arc::new(LogNotifier))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_embed_the_link() {
        let m = EmailMessage::verification("a@b.com", "http://x/verify-email?token=abc");
        assert_eq!(m.subject, "Email Verification");
        assert!(m.body.ends_with("http://x/verify-email?token=abc"));

        let r = EmailMessage::password_reset("a@b.com", "http://x/reset-password?token=def");
        assert_eq!(r.subject, "Password Reset");
        assert!(r.body.contains("token=def"));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let m = EmailMessage::verification("a@b.com", "link");
        assert!(LogNotifier.send(&m).await.is_ok());
    }

    #[test]
    fn smtp_notifier_rejects_bad_sender() {
        let cfg = MailConfig {
            host: "localhost".into(),
            port: 2525,
            secure: false,
            username: None,
            password: None,
            from: "not an address".into(),
            timeout_secs: 1,
        };
        assert!(SmtpNotifier::new(&cfg).is_err());
    }
}
