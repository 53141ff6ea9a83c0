// src/notify/slack.rs
use anyhow::{Context, Result};
use reqwest::Client;

use super::{DeliveryChannel, DeliveryRequest};
use crate::alerts::{AlertChannel, AlertKind};

pub struct SlackSender {
    webhook_url: String,
    client: Client,
}

impl SlackSender {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("SLACK_WEBHOOK_URL").ok()?;
        if url.is_empty() {
            tracing::debug!("slack channel disabled (empty SLACK_WEBHOOK_URL)");
            return None;
        }
        Some(Self::new(url))
    }

    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: Client::new(),
        }
    }

    fn text(req: &DeliveryRequest) -> String {
        let recall = &req.recall;
        let source = recall.key.source.as_str().to_uppercase();
        let link = recall
            .details_url
            .as_deref()
            .map(|u| format!(" <{u}|Read more>"))
            .unwrap_or_default();
        match req.alert.kind {
            AlertKind::NewRecall => {
                format!(":rotating_light: *{source}* recall: *{}*{link}", recall.product)
            }
            AlertKind::RemedyUpdate(_) => {
                let update = recall
                    .remedy_updates
                    .last()
                    .map(|u| u.text.as_str())
                    .unwrap_or_default();
                format!(
                    ":memo: *{source}* remedy update for *{}*: {update}{link}",
                    recall.product
                )
            }
        }
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for SlackSender {
    fn channel(&self) -> AlertChannel {
        AlertChannel::Slack
    }

    async fn deliver(&self, req: &DeliveryRequest) -> Result<()> {
        let mut body = serde_json::json!({ "text": Self::text(req) });
        // channel-owned subscriptions address a specific channel; user
        // preferences fall through to the webhook's default
        if let Some(channel) = req.addresses.first() {
            body["channel"] = serde_json::Value::String(channel.clone());
        }

        self.client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }
}
