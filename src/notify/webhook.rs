// src/notify/webhook.rs
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;

use super::{DeliveryChannel, DeliveryRequest};
use crate::alerts::AlertChannel;

/// Partner webhook POST: the recall as JSON, pushed to whatever URL the
/// subscription registered.
pub struct PartnerWebhookSender {
    client: Client,
    timeout: Duration,
}

impl Default for PartnerWebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

impl PartnerWebhookSender {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    fn payload(req: &DeliveryRequest) -> serde_json::Value {
        let recall = &req.recall;
        serde_json::json!({
            "source": recall.key.source,
            "id": recall.key.external_id,
            "product": recall.product,
            "hazard": recall.hazard,
            "recall_date": recall.recall_date,
            "url": recall.details_url,
            "priority": req.alert.priority,
            "kind": req.alert.kind,
            "remedy_updates": recall.remedy_updates,
        })
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for PartnerWebhookSender {
    fn channel(&self) -> AlertChannel {
        AlertChannel::Webhook
    }

    async fn deliver(&self, req: &DeliveryRequest) -> Result<()> {
        let url = req
            .addresses
            .first()
            .context("webhook delivery without target url")?;
        self.client
            .post(url)
            .timeout(self.timeout)
            .json(&Self::payload(req))
            .send()
            .await
            .context("partner webhook post")?
            .error_for_status()
            .context("partner webhook non-2xx")?;
        Ok(())
    }
}
