use rusqlite::{params, types::Type, Connection, Row};
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};

use crate::error::SitePulseError;

#[derive(AsRefStr, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Webhook,
    Email,
    Slack,
}

/// A configured delivery target for a site's change notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationChannel {
    pub channel_id: i64,
    pub site_id: i64,
    pub channel_type: ChannelType,
    pub target: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub created_at: i64,
}

impl NotificationChannel {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let channel_type: String = row.get(2)?;
        let channel_type = channel_type
            .parse::<ChannelType>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

        Ok(NotificationChannel {
            channel_id: row.get(0)?,
            site_id: row.get(1)?,
            channel_type,
            target: row.get(3)?,
            secret: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    pub fn create(
        conn: &Connection,
        site_id: i64,
        channel_type: ChannelType,
        target: &str,
        secret: Option<&str>,
    ) -> Result<Self, SitePulseError> {
        if target.trim().is_empty() {
            return Err(SitePulseError::InvalidInput(
                "channel target must not be empty".to_string(),
            ));
        }

        let created_at = chrono::Utc::now().timestamp();
        let channel_id = conn.query_row(
            "INSERT INTO notification_channels (site_id, channel_type, target, secret, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING channel_id",
            params![site_id, channel_type.as_ref(), target, secret, created_at],
            |row| row.get(0),
        )?;

        Ok(NotificationChannel {
            channel_id,
            site_id,
            channel_type,
            target: target.to_owned(),
            secret: secret.map(str::to_owned),
            created_at,
        })
    }

    pub fn for_site(conn: &Connection, site_id: i64) -> Result<Vec<Self>, SitePulseError> {
        let mut stmt = conn.prepare(
            "SELECT channel_id, site_id, channel_type, target, secret, created_at
             FROM notification_channels
             WHERE site_id = ?
             ORDER BY channel_id ASC",
        )?;

        let channels = stmt
            .query_map([site_id], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(channels)
    }
}

/// Per-site webhook from the older single-target configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyWebhook {
    pub webhook_id: i64,
    pub site_id: i64,
    pub target_url: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
}

impl LegacyWebhook {
    pub fn create(
        conn: &Connection,
        site_id: i64,
        target_url: &str,
        secret: Option<&str>,
    ) -> Result<Self, SitePulseError> {
        let webhook_id = conn.query_row(
            "INSERT INTO webhooks (site_id, target_url, secret, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING webhook_id",
            params![site_id, target_url, secret, chrono::Utc::now().timestamp()],
            |row| row.get(0),
        )?;

        Ok(LegacyWebhook {
            webhook_id,
            site_id,
            target_url: target_url.to_owned(),
            secret: secret.map(str::to_owned),
        })
    }

    pub fn for_site(conn: &Connection, site_id: i64) -> Result<Vec<Self>, SitePulseError> {
        let mut stmt = conn.prepare(
            "SELECT webhook_id, site_id, target_url, secret
             FROM webhooks
             WHERE site_id = ?
             ORDER BY webhook_id ASC",
        )?;

        let hooks = stmt
            .query_map([site_id], |row| {
                Ok(LegacyWebhook {
                    webhook_id: row.get(0)?,
                    site_id: row.get(1)?,
                    target_url: row.get(2)?,
                    secret: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(hooks)
    }
}
