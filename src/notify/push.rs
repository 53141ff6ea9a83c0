// src/notify/push.rs
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;

use super::{DeliveryChannel, DeliveryRequest};
use crate::alerts::{AlertChannel, AlertKind};

/// Device push delivery through a token-addressed HTTP gateway.
pub struct PushSender {
    endpoint: String,
    client: Client,
}

#[derive(Serialize)]
struct PushMessage<'a> {
    token: &'a str,
    title: String,
    body: String,
}

impl PushSender {
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("PUSH_GATEWAY_URL").ok()?;
        if endpoint.is_empty() {
            tracing::debug!("push channel disabled (empty PUSH_GATEWAY_URL)");
            return None;
        }
        Some(Self::new(endpoint))
    }

    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }

    fn title(req: &DeliveryRequest) -> String {
        match req.alert.kind {
            AlertKind::NewRecall => "Recall alert".to_string(),
            AlertKind::RemedyUpdate(_) => format!("Update on recall {}", req.recall.product),
        }
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for PushSender {
    fn channel(&self) -> AlertChannel {
        AlertChannel::Push
    }

    /// One gateway call per registered device token; the attempt fails if
    /// any token does, so the dispatcher's retry covers all of them.
    async fn deliver(&self, req: &DeliveryRequest) -> Result<()> {
        anyhow::ensure!(!req.addresses.is_empty(), "push delivery without tokens");
        let title = Self::title(req);
        let body = req
            .recall
            .hazard
            .clone()
            .unwrap_or_else(|| req.recall.product.clone());

        for token in &req.addresses {
            let msg = PushMessage {
                token,
                title: title.clone(),
                body: body.clone(),
            };
            self.client
                .post(&self.endpoint)
                .json(&msg)
                .send()
                .await
                .context("push gateway post")?
                .error_for_status()
                .context("push gateway non-2xx")?;
        }
        Ok(())
    }
}
