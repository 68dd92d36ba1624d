use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};

use notification_pipeline::{
    api,
    apns::ApnsSender,
    clock::SystemClock,
    config::Config,
    db,
    expo::ExpoSender,
    logging,
    push::PushRouter,
    scheduler::Scheduler,
    settings::{SettingsProvider, StaticSettings},
    store::{MemoryStore, StateStore},
    tasks,
};

fn main() -> Result<()> {
    // Build custom runtime with explicit thread configuration
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(async {
        // .env may carry LOG_LEVEL, so load it before logging
        dotenv::dotenv().ok();
        logging::setup_logging();

        info!("Starting notification pipeline");

        let config = Config::from_env()?;

        let apns = match &config.apns {
            Some(apns) => Some(ApnsSender::new(
                &apns.key_path,
                &apns.key_id,
                &apns.team_id,
                &apns.topic,
                apns.production,
            )?),
            None => {
                warn!("APNs not configured, APNs tokens will fail permanently");
                None
            }
        };
        let expo = ExpoSender::new(
            &config.expo_push_url,
            config.expo_access_token.clone(),
            config.pipeline.send_timeout,
        )?;
        let sender = PushRouter::new(apns, Some(expo));

        match config.database_url.clone() {
            Some(database_url) => {
                let db_pool = db::init_db_pool(&database_url).await?;
                let settings = db::PgSettingsProvider::new(db_pool.clone());
                let store = Arc::new(db::PgStore::new(db_pool));
                run(config, sender, settings, store).await
            }
            None => {
                warn!("DATABASE_URL not set, pipeline state lives in memory only");
                run(config, sender, StaticSettings::default(), Arc::new(MemoryStore::new())).await
            }
        }
    })
}

async fn run<S, K>(config: Config, sender: PushRouter, settings: S, store: Arc<K>) -> Result<()>
where
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    let (scheduler, immediate_receiver) =
        Scheduler::open(config.pipeline.clone(), Arc::new(SystemClock), sender, settings, store)
            .await
            .context("Failed to restore pipeline state")?;
    let scheduler = Arc::new(scheduler);

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processing_handle = tokio::spawn(tasks::run_processing_loop(
        scheduler.clone(),
        config.tick_interval,
        shutdown_rx.clone(),
    ));
    let cleanup_handle = tokio::spawn(tasks::run_cleanup_loop(
        scheduler.clone(),
        config.cleanup_interval,
        shutdown_rx.clone(),
    ));
    let immediate_handle = tokio::spawn(tasks::run_immediate_sender(
        scheduler.clone(),
        immediate_receiver,
        shutdown_rx.clone(),
    ));

    // Spawn API server
    let api_state = Arc::new(api::ApiState {
        scheduler: scheduler.clone(),
        auth_token: config.api_auth_token.clone(),
    });
    let api_router = api::create_api_router(api_state);
    let listener = tokio::net::TcpListener::bind(&config.api_bind_address)
        .await
        .context(format!("Failed to bind {}", config.api_bind_address))?;
    info!("Starting API server on {}", config.api_bind_address);

    let mut api_shutdown = shutdown_rx.clone();
    let api_handle = tokio::spawn(async move {
        let result = axum::serve(listener, api_router)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!("API server error: {}", e);
        }
    });

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, shutting down gracefully");

    // Send shutdown signal to tasks
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(processing_handle, cleanup_handle, immediate_handle, api_handle);

    scheduler.close().await;
    info!("Shutdown complete");
    Ok(())
}
