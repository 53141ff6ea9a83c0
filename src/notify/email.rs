// src/notify/email.rs
use anyhow::{Context, Result};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::{DeliveryChannel, DeliveryRequest};
use crate::alerts::{AlertChannel, AlertKind};

pub struct EmailSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    /// None when SMTP_HOST is unset; Err when it is set but unusable
    /// (that is a configuration mistake worth aborting on).
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            tracing::debug!("email channel disabled (no SMTP_HOST)");
            return Ok(None);
        };
        let user = std::env::var("SMTP_USER").context("SMTP_USER missing")?;
        let pass = std::env::var("SMTP_PASS").context("SMTP_PASS missing")?;
        let from_addr = std::env::var("ALERTS_FROM_EMAIL")
            .unwrap_or_else(|_| "alerts@recall-sentinel.dev".to_string());

        let creds = Credentials::new(user, pass);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .with_context(|| format!("invalid SMTP_HOST {host}"))?
            .credentials(creds)
            .build();
        let from = from_addr
            .parse()
            .with_context(|| format!("invalid ALERTS_FROM_EMAIL {from_addr}"))?;

        Ok(Some(Self { mailer, from }))
    }

    fn subject(req: &DeliveryRequest) -> String {
        match req.alert.kind {
            AlertKind::NewRecall => format!("Recall Alert: {}", req.recall.product),
            AlertKind::RemedyUpdate(_) => format!("Update: {} recall", req.recall.product),
        }
    }

    fn body(req: &DeliveryRequest) -> String {
        let recall = &req.recall;
        let mut lines = vec![
            format!("Product: {}", recall.product),
            format!("Source: {}", recall.key.source),
        ];
        if let Some(h) = &recall.hazard {
            lines.push(format!("Hazard: {h}"));
        }
        if let AlertKind::RemedyUpdate(_) = req.alert.kind {
            if let Some(update) = recall.remedy_updates.last() {
                lines.push(format!("Remedy update: {}", update.text));
            }
        }
        if let Some(url) = &recall.details_url {
            lines.push(format!("Details: {url}"));
        }
        lines.push(String::new());
        lines.push("You are receiving this because a monitored product or saved search matched this recall.".to_string());
        lines.join("\n")
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for EmailSender {
    fn channel(&self) -> AlertChannel {
        AlertChannel::Email
    }

    async fn deliver(&self, req: &DeliveryRequest) -> Result<()> {
        let to_addr = req
            .addresses
            .first()
            .context("email delivery without recipient address")?;
        let to: Mailbox = to_addr
            .parse()
            .with_context(|| format!("invalid recipient address {to_addr}"))?;

        let msg = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(Self::subject(req))
            .header(header::ContentType::TEXT_PLAIN)
            .body(Self::body(req))
            .context("build email")?;

        self.mailer.send(msg).await.context("send email")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertStatus, Recipient};
    use crate::ingest::types::{RecallKey, Source};
    use crate::priority::Priority;
    use crate::store::{Recall, RemedyUpdate};
    use chrono::{TimeZone, Utc};

    fn request(kind: AlertKind) -> DeliveryRequest {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        DeliveryRequest {
            alert: Alert {
                id: 1,
                recipient: Recipient::User(1),
                recall: RecallKey::new(Source::Cpsc, "1"),
                product_id: None,
                subscription_id: None,
                channel: AlertChannel::Email,
                kind,
                priority: Priority::Urgent,
                status: AlertStatus::Pending,
                created_at: now,
                sent_at: None,
                last_error: None,
            },
            recall: Recall {
                key: RecallKey::new(Source::Cpsc, "1"),
                product: "Widget".into(),
                hazard: Some("Fire".into()),
                recall_date: None,
                details_url: Some("https://example.test/r/1".into()),
                classification: None,
                brand: None,
                category: None,
                upcs: vec![],
                vins: vec![],
                raw_payload: serde_json::Value::Null,
                payload_sha256: String::new(),
                fetched_at: now,
                inserted_at: now,
                remedy_updates: vec![RemedyUpdate {
                    time: now,
                    text: "Refund available".into(),
                }],
            },
            addresses: vec!["user@example.test".into()],
        }
    }

    #[test]
    fn subject_reflects_alert_kind() {
        assert_eq!(
            EmailSender::subject(&request(AlertKind::NewRecall)),
            "Recall Alert: Widget"
        );
        assert_eq!(
            EmailSender::subject(&request(AlertKind::RemedyUpdate(1))),
            "Update: Widget recall"
        );
    }

    #[test]
    fn remedy_body_includes_latest_update() {
        let body = EmailSender::body(&request(AlertKind::RemedyUpdate(1)));
        assert!(body.contains("Remedy update: Refund available"));
        assert!(body.contains("Hazard: Fire"));
    }
}
