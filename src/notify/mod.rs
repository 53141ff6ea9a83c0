// src/notify/mod.rs
//! Alert delivery, decoupled from ingestion: alert creation enqueues an id,
//! a worker task drives each row through pending -> sent | failed with
//! per-attempt backoff. Delivered alerts are re-published on a broadcast
//! channel for whatever serves live connections; nothing here is global
//! state.

pub mod email;
pub mod push;
pub mod slack;
pub mod webhook;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use metrics::counter;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::alerts::{Alert, AlertChannel, AlertStatus, AlertStore, Recipient};
use crate::matching::UserDirectory;
use crate::store::{Recall, RecallStore};

/// Published on the broadcast channel after a successful delivery.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub alert: Alert,
    pub product: String,
}

/// One delivery attempt's input. `addresses` is already resolved per
/// channel: recipient email, push tokens, Slack channel id (possibly empty,
/// meaning the sender's default), or the partner webhook URL.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub alert: Alert,
    pub recall: Recall,
    pub addresses: Vec<String>,
}

/// The single transport contract every channel implements.
#[async_trait::async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn channel(&self) -> AlertChannel;
    async fn deliver(&self, req: &DeliveryRequest) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Total delivery attempts before the row is marked failed.
    pub max_attempts: u8,
    pub backoff_base: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed,
    /// Row was already sent (or vanished); nothing to do.
    Skipped,
}

/// Cloneable front half of the dispatcher: producers enqueue alert ids,
/// live-connection consumers subscribe to delivered events.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<u64>,
    events: broadcast::Sender<AlertEvent>,
}

impl DispatcherHandle {
    pub fn enqueue(&self, alert_id: u64) {
        if self.tx.send(alert_id).is_err() {
            tracing::warn!(alert_id, "dispatcher queue closed, alert stays pending");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }
}

pub struct Dispatcher {
    alerts: Arc<AlertStore>,
    store: Arc<RecallStore>,
    directory: Arc<dyn UserDirectory>,
    channels: HashMap<AlertChannel, Arc<dyn DeliveryChannel>>,
    config: DispatcherConfig,
    handle: DispatcherHandle,
    rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl Dispatcher {
    pub fn new(
        alerts: Arc<AlertStore>,
        store: Arc<RecallStore>,
        directory: Arc<dyn UserDirectory>,
        channels: Vec<Arc<dyn DeliveryChannel>>,
        config: DispatcherConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let channels = channels.into_iter().map(|c| (c.channel(), c)).collect();
        Self {
            alerts,
            store,
            directory,
            channels,
            config,
            handle: DispatcherHandle { tx, events },
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Start the worker loop. The queue drains independently of ingestion,
    /// so a slow transport never blocks a refresh tick.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut rx = self
            .rx
            .lock()
            .expect("dispatcher rx mutex poisoned")
            .take()
            .expect("dispatcher already spawned");
        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                self.deliver_with_retry(id).await;
            }
        })
    }

    /// Resolve where this alert goes. `Err` is a permanent addressing
    /// failure; retrying cannot fix a missing email or token.
    fn addresses_for(&self, alert: &Alert) -> Result<Vec<String>, String> {
        match (&alert.recipient, alert.channel) {
            (Recipient::User(uid), AlertChannel::Email) => self
                .directory
                .email_for(*uid)
                .map(|e| vec![e])
                .ok_or_else(|| format!("user {uid} has no email address")),
            (Recipient::User(uid), AlertChannel::Push) => {
                let tokens = self.directory.push_tokens_for(*uid);
                if tokens.is_empty() {
                    Err(format!("user {uid} has no push tokens"))
                } else {
                    Ok(tokens)
                }
            }
            (Recipient::User(_), AlertChannel::Slack) => Ok(Vec::new()),
            (Recipient::SlackChannel(ch), AlertChannel::Slack) => Ok(vec![ch.clone()]),
            (Recipient::PartnerWebhook(url), AlertChannel::Webhook) => Ok(vec![url.clone()]),
            (recipient, channel) => Err(format!(
                "recipient {recipient:?} cannot receive {channel:?} deliveries"
            )),
        }
    }

    /// Drive one alert through the retry state machine. Only a successful
    /// attempt sets `sent_at`; exhaustion records the last error and stops.
    pub async fn deliver_with_retry(&self, alert_id: u64) -> DeliveryOutcome {
        let Some(alert) = self.alerts.get(alert_id) else {
            tracing::warn!(alert_id, "delivery requested for unknown alert");
            return DeliveryOutcome::Skipped;
        };
        if alert.status == AlertStatus::Sent {
            return DeliveryOutcome::Skipped;
        }

        let Some(recall) = self.store.get(&alert.recall) else {
            self.alerts.mark_failed(alert_id, "recall no longer in store");
            counter!("dispatch_failed_total").increment(1);
            return DeliveryOutcome::Failed;
        };
        let Some(channel) = self.channels.get(&alert.channel) else {
            let err = format!("no transport configured for channel {}", alert.channel.as_str());
            tracing::warn!(alert_id, channel = alert.channel.as_str(), "{err}");
            self.alerts.mark_failed(alert_id, &err);
            counter!("dispatch_failed_total").increment(1);
            return DeliveryOutcome::Failed;
        };
        let addresses = match self.addresses_for(&alert) {
            Ok(a) => a,
            Err(err) => {
                self.alerts.mark_failed(alert_id, &err);
                counter!("dispatch_failed_total").increment(1);
                return DeliveryOutcome::Failed;
            }
        };

        let product = recall.product.clone();
        let req = DeliveryRequest {
            alert: alert.clone(),
            recall,
            addresses,
        };

        let mut last_err = String::new();
        for attempt in 1..=self.config.max_attempts.max(1) {
            match channel.deliver(&req).await {
                Ok(()) => {
                    self.alerts.mark_sent(alert_id, Utc::now());
                    counter!("dispatch_sent_total", "channel" => alert.channel.as_str())
                        .increment(1);
                    if let Some(sent) = self.alerts.get(alert_id) {
                        let _ = self.handle.events.send(AlertEvent {
                            alert: sent,
                            product: product.clone(),
                        });
                    }
                    return DeliveryOutcome::Sent;
                }
                Err(e) => {
                    last_err = format!("{e:#}");
                    counter!("dispatch_retries_total", "channel" => alert.channel.as_str())
                        .increment(1);
                    tracing::warn!(
                        alert_id,
                        channel = alert.channel.as_str(),
                        attempt,
                        error = %last_err,
                        "delivery attempt failed"
                    );
                    if attempt < self.config.max_attempts {
                        let delay = self
                            .config
                            .backoff_base
                            .saturating_mul(1u32 << (attempt - 1).min(16));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.alerts.mark_failed(alert_id, &last_err);
        counter!("dispatch_failed_total").increment(1);
        DeliveryOutcome::Failed
    }
}

/// Build every transport the environment configures. Invalid configuration
/// (a set but unusable SMTP host) is fatal; an unset one just leaves that
/// channel out.
pub fn channels_from_env() -> Result<Vec<Arc<dyn DeliveryChannel>>> {
    let mut out: Vec<Arc<dyn DeliveryChannel>> = Vec::new();
    if let Some(sender) = email::EmailSender::from_env()? {
        out.push(Arc::new(sender));
    }
    if let Some(sender) = slack::SlackSender::from_env() {
        out.push(Arc::new(sender));
    }
    if let Some(sender) = push::PushSender::from_env() {
        out.push(Arc::new(sender));
    }
    out.push(Arc::new(webhook::PartnerWebhookSender::new()));
    Ok(out)
}
