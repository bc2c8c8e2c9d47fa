//! Deny-list notifications
//!
//! Fire-and-forget SMTP mail on deny additions. Notices go onto a bounded
//! queue drained by one background task; a full queue drops the notice with
//! a warning rather than blocking the admission path. Delivery failures are
//! logged only.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::config::EmailConfig;

const QUEUE_DEPTH: usize = 32;

struct Notice {
    ip: String,
    reason: String,
}

/// Asynchronous ban-notification mailer.
#[derive(Clone)]
pub struct Mailer {
    tx: mpsc::Sender<Notice>,
}

impl Mailer {
    /// Spawn the background sender. The transport is built once; a broken
    /// SMTP configuration disables delivery but never the guard itself.
    pub fn new(config: EmailConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notice>(QUEUE_DEPTH);

        tokio::spawn(async move {
            let transport = match build_transport(&config) {
                Ok(transport) => transport,
                Err(err) => {
                    error!("SMTP transport unavailable, notifications disabled: {}", err);
                    return;
                }
            };

            while let Some(notice) = rx.recv().await {
                match compose(&config, &notice.ip, &notice.reason) {
                    Ok(message) => {
                        if let Err(err) = transport.send(message).await {
                            error!("failed to send ban notice for {}: {}", notice.ip, err);
                        }
                    }
                    Err(err) => error!("failed to compose ban notice for {}: {}", notice.ip, err),
                }
            }
        });

        Self { tx }
    }

    /// Queue a notice; drops with a warning when the queue is full.
    pub fn notify(&self, ip: &str, reason: &str) {
        let notice = Notice {
            ip: ip.to_string(),
            reason: reason.to_string(),
        };
        if self.tx.try_send(notice).is_err() {
            warn!("notification queue full, dropping notice for {}", ip);
        }
    }
}

fn build_transport(
    config: &EmailConfig,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?;
    if config.port != 0 {
        builder = builder.port(config.port);
    }
    if !config.username.is_empty() {
        builder = builder.credentials(Credentials::new(
            config.username.clone(),
            config.password.clone(),
        ));
    }
    Ok(builder.build())
}

/// Render a notice, honoring the configured subject/body hooks. Empty hook
/// output falls back to the defaults.
fn render(config: &EmailConfig, ip: &str, reason: &str) -> (String, String) {
    let mut subject = format!("[ip-sentinel] IP {ip} has been banned");
    if let Some(hook) = &config.subject {
        let custom = hook(ip, reason);
        if !custom.is_empty() {
            subject = custom;
        }
    }

    let mut body = format!("[ip-sentinel] IP {ip} has been banned for {reason}");
    if let Some(hook) = &config.body {
        let custom = hook(ip, reason);
        if !custom.is_empty() {
            body = custom;
        }
    }

    (subject, body)
}

fn compose(
    config: &EmailConfig,
    ip: &str,
    reason: &str,
) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
    let (subject, body) = render(config, ip, reason);

    let mut builder = Message::builder().from(config.from.parse::<Mailbox>()?);
    for to in &config.to {
        builder = builder.to(to.parse::<Mailbox>()?);
    }
    for cc in &config.cc {
        builder = builder.cc(cc.parse::<Mailbox>()?);
    }

    Ok(builder.subject(subject).body(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config() -> EmailConfig {
        EmailConfig {
            host: "smtp.example.com".into(),
            from: "guard@example.com".into(),
            to: vec!["ops@example.com".into()],
            ..EmailConfig::default()
        }
    }

    #[test]
    fn test_default_subject_and_body() {
        let (subject, body) = render(&config(), "1.2.3.4", "scanner");
        assert_eq!(subject, "[ip-sentinel] IP 1.2.3.4 has been banned");
        assert!(body.contains("scanner"));
    }

    #[test]
    fn test_hooks_override_defaults() {
        let mut cfg = config();
        cfg.subject = Some(Arc::new(|ip, _| format!("banned: {ip}")));
        cfg.body = Some(Arc::new(|_, _| String::new())); // empty -> default

        let (subject, body) = render(&cfg, "1.2.3.4", "scanner");
        assert_eq!(subject, "banned: 1.2.3.4");
        assert!(body.starts_with("[ip-sentinel]"));
    }

    #[test]
    fn test_compose_builds_message() {
        let message = compose(&config(), "1.2.3.4", "scanner");
        assert!(message.is_ok());
    }
}
