use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{error, info, warn};
use serde::Serialize;
use sha2::Sha256;

use crate::changes::ChangeCounts;
use crate::channels::{ChannelType, LegacyWebhook, NotificationChannel};
use crate::config::{NotifyConfig, SmtpConfig};
use crate::database::Database;
use crate::error::SitePulseError;
use crate::sites::Site;

pub const SIGNATURE_HEADER: &str = "X-SitePulse-Signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ScanCompleted,
    Test,
}

/// Payload delivered to every channel of a site
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub site_id: i64,
    pub root_url: String,
    pub scan_id: Option<i64>,
    pub added: i64,
    pub removed: i64,
    pub updated: i64,
    pub occurred_at: i64,
}

impl ChangeNotification {
    pub fn for_scan(site: &Site, scan_id: i64, counts: ChangeCounts) -> Self {
        ChangeNotification {
            kind: NotificationKind::ScanCompleted,
            site_id: site.site_id,
            root_url: site.root_url.clone(),
            scan_id: Some(scan_id),
            added: counts.added,
            removed: counts.removed,
            updated: counts.updated,
            occurred_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Synthetic payload used to check that a site's channels are reachable
    pub fn test(site: &Site) -> Self {
        ChangeNotification {
            kind: NotificationKind::Test,
            site_id: site.site_id,
            root_url: site.root_url.clone(),
            scan_id: None,
            added: 1,
            removed: 0,
            updated: 0,
            occurred_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn subject(&self) -> String {
        match self.kind {
            NotificationKind::ScanCompleted => format!("sitePulse: changes on {}", self.root_url),
            NotificationKind::Test => format!("sitePulse: test notification for {}", self.root_url),
        }
    }

    pub fn summary(&self) -> String {
        let counts = format!(
            "{} added, {} removed, {} updated",
            self.added, self.removed, self.updated
        );
        match (self.kind, self.scan_id) {
            (NotificationKind::Test, _) => {
                format!("Test notification for {}: {}", self.root_url, counts)
            }
            (_, Some(scan_id)) => format!("{} changed in scan {}: {}", self.root_url, scan_id, counts),
            (_, None) => format!("{} changed: {}", self.root_url, counts),
        }
    }
}

/// Outgoing mail seam. The SMTP implementation is used when `[notify.smtp]` is configured.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SitePulseError>;
}

pub struct SmtpEmailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailTransport {
    pub fn from_config(config: &SmtpConfig) -> Result<Self, SitePulseError> {
        let from: Mailbox = config.from.parse().map_err(|e| {
            SitePulseError::InvalidInput(format!("invalid SMTP from address '{}': {}", config.from, e))
        })?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| SitePulseError::Error(format!("SMTP setup failed: {}", e)))?
            .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(SmtpEmailTransport {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SitePulseError> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| SitePulseError::DeliveryFailure(format!("invalid address '{}': {}", to, e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_owned())
            .map_err(|e| SitePulseError::DeliveryFailure(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| SitePulseError::DeliveryFailure(e.to_string()))?;

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryOutcome {
    pub channel_type: ChannelType,
    pub target: String,
    pub delivered: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub outcomes: Vec<DeliveryOutcome>,
}

struct DeliveryTarget {
    channel_type: ChannelType,
    target: String,
    secret: Option<String>,
}

/// Fans a notification out to a site's channels and legacy webhooks
pub struct NotificationDispatcher {
    db: Database,
    client: reqwest::Client,
    email: Option<Arc<dyn EmailTransport>>,
}

impl NotificationDispatcher {
    pub fn new(db: Database, config: &NotifyConfig) -> Result<Self, SitePulseError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SitePulseError::Error(format!("Failed to build HTTP client: {}", e)))?;

        let email: Option<Arc<dyn EmailTransport>> = match &config.smtp {
            Some(smtp) => match SmtpEmailTransport::from_config(smtp) {
                Ok(transport) => Some(Arc::new(transport)),
                Err(e) => {
                    error!("Email delivery disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(NotificationDispatcher { db, client, email })
    }

    pub fn with_email_transport(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.email = Some(transport);
        self
    }

    /// Deliver `notification` to every channel of the site.
    ///
    /// A failing channel is logged and recorded in the report; the others are still attempted.
    pub async fn notify_change(
        &self,
        site_id: i64,
        notification: &ChangeNotification,
    ) -> Result<DeliveryReport, SitePulseError> {
        let targets = self.load_targets(site_id).await?;
        let mut report = DeliveryReport::default();

        for target in targets {
            let result = self.deliver(&target, notification).await;
            let error = match result {
                Ok(()) => {
                    info!(
                        "Delivered notification for site {} to {} {}",
                        site_id, target.channel_type, target.target
                    );
                    report.delivered += 1;
                    None
                }
                Err(e) => {
                    warn!(
                        "Notification for site {} to {} {} failed: {}",
                        site_id, target.channel_type, target.target, e
                    );
                    report.failed += 1;
                    Some(e.to_string())
                }
            };

            report.outcomes.push(DeliveryOutcome {
                channel_type: target.channel_type,
                target: target.target,
                delivered: error.is_none(),
                error,
            });
        }

        Ok(report)
    }

    async fn load_targets(&self, site_id: i64) -> Result<Vec<DeliveryTarget>, SitePulseError> {
        self.db
            .run_blocking(move |conn| {
                let mut targets: Vec<DeliveryTarget> = NotificationChannel::for_site(conn, site_id)?
                    .into_iter()
                    .map(|channel| DeliveryTarget {
                        channel_type: channel.channel_type,
                        target: channel.target,
                        secret: channel.secret,
                    })
                    .collect();

                targets.extend(LegacyWebhook::for_site(conn, site_id)?.into_iter().map(|hook| {
                    DeliveryTarget {
                        channel_type: ChannelType::Webhook,
                        target: hook.target_url,
                        secret: hook.secret,
                    }
                }));

                Ok(targets)
            })
            .await
    }

    async fn deliver(
        &self,
        target: &DeliveryTarget,
        notification: &ChangeNotification,
    ) -> Result<(), SitePulseError> {
        match target.channel_type {
            ChannelType::Webhook => {
                let body = serde_json::to_vec(notification)
                    .map_err(|e| SitePulseError::DeliveryFailure(e.to_string()))?;
                self.post_json(&target.target, body, target.secret.as_deref())
                    .await
            }
            ChannelType::Slack => {
                let body = serde_json::to_vec(&serde_json::json!({ "text": notification.summary() }))
                    .map_err(|e| SitePulseError::DeliveryFailure(e.to_string()))?;
                self.post_json(&target.target, body, target.secret.as_deref())
                    .await
            }
            ChannelType::Email => match &self.email {
                Some(transport) => {
                    transport
                        .send(&target.target, &notification.subject(), &notification.summary())
                        .await
                }
                None => Err(SitePulseError::DeliveryFailure(
                    "no email transport configured".to_string(),
                )),
            },
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
        secret: Option<&str>,
    ) -> Result<(), SitePulseError> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(secret) = secret {
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", sign_payload(secret, &body)));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| SitePulseError::DeliveryFailure(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SitePulseError::DeliveryFailure(format!(
                "POST {} returned HTTP {}",
                url,
                status.as_u16()
            )));
        }

        Ok(())
    }
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
