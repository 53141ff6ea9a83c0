//! Recall Sentinel — Binary Entrypoint
//! Boots the admin HTTP server and the background pipeline: periodic source
//! refresh, remedy polling, and the alert delivery worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use recall_sentinel::alerts::AlertStore;
use recall_sentinel::api::{self, AppState};
use recall_sentinel::config::AppConfig;
use recall_sentinel::ingest::adapters;
use recall_sentinel::ingest::http::SourceClient;
use recall_sentinel::ingest::scheduler::{spawn_refresh_scheduler, spawn_remedy_scheduler};
use recall_sentinel::ingest::{Pipeline, RefreshConfig};
use recall_sentinel::matching::{InMemoryDirectory, UserDirectory};
use recall_sentinel::metrics::Metrics;
use recall_sentinel::notify::{self, Dispatcher, DispatcherConfig};
use recall_sentinel::remedy::{RemedyPoller, RemedyPollerConfig};
use recall_sentinel::store::{RecallStore, Watermarks};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("recall_sentinel=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env();
    let metrics = Metrics::init();

    let store = Arc::new(RecallStore::with_snapshot(&config.state_path));
    match store.load_snapshot().await {
        Ok(n) if n > 0 => tracing::info!(recalls = n, "snapshot loaded"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "snapshot load failed, starting empty"),
    }

    let alerts = Arc::new(AlertStore::new());
    let directory: Arc<dyn UserDirectory> = if config.demo_seed {
        tracing::info!("demo directory seeded");
        Arc::new(InMemoryDirectory::demo_seed())
    } else {
        Arc::new(InMemoryDirectory::new())
    };

    let client = Arc::new(
        SourceClient::new(config.http_timeout, &config.cache_dir)
            .context("building source client")?,
    );

    let channels = notify::channels_from_env().context("building delivery channels")?;
    let dispatcher = Arc::new(Dispatcher::new(
        alerts.clone(),
        store.clone(),
        directory.clone(),
        channels,
        DispatcherConfig {
            max_attempts: config.max_delivery_attempts,
            backoff_base: config.delivery_backoff,
        },
    ));
    let _delivery_worker = dispatcher.clone().spawn();

    let watermarks = Arc::new(Watermarks::new());
    let adapter_list = adapters::registry(
        client.clone(),
        directory.clone(),
        config.enabled_sources.as_deref(),
    );
    tracing::info!(adapters = adapter_list.len(), "source adapters registered");

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        alerts.clone(),
        directory.clone(),
        dispatcher.handle(),
        watermarks.clone(),
        adapter_list,
        RefreshConfig {
            cutoff_days: config.cutoff_days,
            source_budget: config.source_budget,
            flag_after: config.flag_after,
            per_source_interval: config.per_source_interval.clone(),
        },
    ));
    let poller = Arc::new(RemedyPoller::new(
        store.clone(),
        alerts.clone(),
        directory,
        dispatcher.handle(),
        client,
        watermarks,
        RemedyPollerConfig::default(),
    ));

    let _refresh_task = spawn_refresh_scheduler(pipeline.clone(), config.refresh_interval);
    let _remedy_task = spawn_remedy_scheduler(poller, config.remedy_interval);

    let state = AppState {
        pipeline,
        store,
        alerts,
    };
    let router = api::create_router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, router).await.context("serving")?;
    Ok(())
}
