//! CardLedger server
//!
//! Wires the PostgreSQL ledger store into the authorization engine, the
//! provider webhook ingestor, referral crediting and the background workers,
//! then serves the HTTP API until interrupted.

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use cardledger_api::{configure, WebhookEndpoint};
use cardledger_core::{
    traits::{LedgerStore, Notifier, ProviderClient},
    AppConfig,
};
use cardledger_db::{
    create_pool, run_migrations, PgGradeRepository, PgLedgerStore, PgReferralRepository,
};
use cardledger_services::{
    AntiFraudGuard, AuthorizationService, BalanceSyncService, GradeService, HttpProviderClient,
    LogNotifier, ReplenishmentScheduler, RevShareService, WebhookIngestor,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cardledger={lvl},cardledger_api={lvl},cardledger_services={lvl},cardledger_db={lvl},actix_web=info,sqlx=warn",
            lvl = log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    if env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting CardLedger v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load().context("Failed to load configuration")?;

    info!("Connecting to database...");
    let pool = create_pool(&config.database.url, Some(config.database.max_connections))
        .await
        .context("Failed to create database pool")?;

    if config.database.run_migrations {
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
    }

    let lock_timeout = config.database.lock_timeout();
    let ledger: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone(), lock_timeout));
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());

    let grades = Arc::new(GradeService::new(
        ledger.clone(),
        Arc::new(PgGradeRepository::new(pool.clone())),
        config.billing.default_fee_percent,
    ));

    let revshare = Arc::new(RevShareService::new(
        Arc::new(PgReferralRepository::new(pool.clone(), lock_timeout)),
        config.referral.revshare_percent,
    ));
    info!("Referral commission: {}%", revshare.percent());

    let authorization = web::Data::new(
        AuthorizationService::new(
            ledger.clone(),
            grades.clone(),
            AntiFraudGuard::new(ledger.clone(), config.billing.fraud_threshold),
            notifier.clone(),
            config.billing.decline_fee,
        )
        .with_revshare(revshare.clone()),
    );

    let provider: Option<Arc<dyn ProviderClient>> = HttpProviderClient::from_config(&config.provider)
        .context("Failed to build provider client")?
        .map(|client| Arc::new(client) as Arc<dyn ProviderClient>);

    let mut ingestor = WebhookIngestor::new(ledger.clone(), grades.clone(), notifier.clone())
        .with_revshare(revshare);
    if let Some(provider) = &provider {
        ingestor = ingestor.with_provider(provider.clone());
    }
    let webhook = web::Data::new(
        WebhookEndpoint::new(&config.webhook, ingestor)
            .context("Invalid webhook configuration")?,
    );

    // Background workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    if config.replenishment.enabled {
        let scheduler = Arc::new(ReplenishmentScheduler::from_config(
            ledger.clone(),
            notifier.clone(),
            &config.replenishment,
        ));
        workers.push(scheduler.start(shutdown_rx.clone()));
    } else {
        info!("Auto-replenishment disabled");
    }

    match (&provider, config.provider.sync_interval_secs) {
        (Some(provider), secs) if secs > 0 => {
            let sync = Arc::new(BalanceSyncService::new(ledger.clone(), provider.clone()));
            workers.push(sync.start(Duration::from_secs(secs), shutdown_rx.clone()));
        }
        (None, secs) if secs > 0 => {
            warn!("Provider balance sync configured but no provider API key is set");
        }
        _ => {}
    }

    let bind_addr = config.server_addr();
    info!(
        "Starting HTTP server on {} with {} workers",
        bind_addr, config.server.workers
    );

    HttpServer::new(move || {
        App::new()
            .app_data(authorization.clone())
            .app_data(webhook.clone())
            .wrap(TracingLogger::default())
            .configure(configure)
    })
    .workers(config.server.workers)
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run()
    .await
    .context("HTTP server failed")?;

    info!("HTTP server stopped, shutting down background workers");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Background worker ended abnormally: {}", e);
        }
    }

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
