pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod ollama;
pub mod trigger;
pub mod worker;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use api::AppState;
use auth::{AuthFailureLimiter, Authorizer};
use config::AppConfig;
use database::{Database, TokenScope};
use trigger::{JobDispatcher, TriggerEngine, TriggerPolicy};

/// Initialise logging. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Load configuration and open the database, creating directories as needed.
pub fn open(data_dir: &std::path::Path) -> anyhow::Result<(AppConfig, Arc<Database>)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {:?}", data_dir))?;
    let config = AppConfig::load(data_dir)?;
    std::fs::create_dir_all(config.episodes_dir())?;
    std::fs::create_dir_all(config.processed_dir())?;

    let db_path = config.database_path();
    log::info!("Database path: {}", db_path.display());
    let db = Arc::new(Database::new(&db_path)?);
    Ok((config, db))
}

/// Run the HTTP server, pipeline worker and optional sweep until Ctrl-C.
pub async fn run(data_dir: &std::path::Path) -> anyhow::Result<()> {
    init_logging();
    log::info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let (config, db) = open(data_dir)?;

    let shutdown = CancellationToken::new();
    let (dispatcher, wake_rx) = JobDispatcher::channel(64);

    tokio::spawn(check_classifier(ollama::OllamaClient::new(&config.classifier)));

    let pipeline = Arc::new(worker::PipelineWorker::from_config(&config, db.clone()));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pipeline.run(wake_rx, shutdown).await });
    }

    if config.scheduled_sweep_minutes > 0 {
        tokio::spawn(worker::sweep::run_sweep(
            db.clone(),
            config.cooldown(),
            dispatcher.clone(),
            Duration::from_secs(config.scheduled_sweep_minutes * 60),
            shutdown.clone(),
        ));
    }

    let state = AppState {
        db: db.clone(),
        engine: Arc::new(TriggerEngine::new(
            db.clone(),
            TriggerPolicy::from(&config.trigger),
            dispatcher,
        )),
        authorizer: Arc::new(Authorizer::new(db.clone())),
        limiter: Arc::new(AuthFailureLimiter::new(&config.auth)),
        admin_key: config.admin_key.clone(),
    };
    if state.admin_key.is_none() {
        log::info!("ADSTRIP_ADMIN_KEY not set, job admin routes disabled");
    }
    let app = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    log::info!("Listening on http://{}", config.bind_addr);

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutdown requested");
        signal.cancel();
    })
    .await?;

    shutdown.cancel();
    Ok(())
}

/// Startup probe of the classifier. Jobs still run if it is down; their
/// classifying stage fails and retries on the next trigger.
async fn check_classifier(client: ollama::OllamaClient) {
    match client.health_check().await {
        Ok(status) if status.model_available => {
            log::info!("Ollama ready with model {}", status.model);
        }
        Ok(status) => log::warn!(
            "Ollama is running but model {} is not pulled (available: {})",
            status.model,
            status.available_models.join(", ")
        ),
        Err(e) => log::warn!("Ollama unavailable: {}", e),
    }
}

/// Revoke a token by id.
pub fn revoke_token_command(data_dir: &std::path::Path, token_id: &str) -> anyhow::Result<()> {
    let (_config, db) = open(data_dir)?;
    if !db.revoke_token(token_id)? {
        anyhow::bail!("no live token {}", token_id);
    }
    println!("revoked {}", token_id);
    Ok(())
}

/// List prompt presets, or make `select` the active one first.
pub fn presets_command(data_dir: &std::path::Path, select: Option<&str>) -> anyhow::Result<()> {
    let (_config, db) = open(data_dir)?;
    if let Some(name) = select {
        if !db.set_active_preset(name)? {
            anyhow::bail!("unknown preset {:?}", name);
        }
    }
    for preset in db.list_presets()? {
        println!(
            "{} {:<14} min_confidence={:.2}",
            if preset.is_active { "*" } else { " " },
            preset.name,
            preset.min_confidence
        );
    }
    Ok(())
}

/// Issue (or rotate) a token from the command line. No feed means a
/// combined token.
pub fn issue_token_command(
    data_dir: &std::path::Path,
    principal: i64,
    feed_id: Option<i64>,
) -> anyhow::Result<()> {
    let (_config, db) = open(data_dir)?;
    let scope = match feed_id {
        Some(feed_id) => {
            db.get_feed(feed_id)?
                .with_context(|| format!("feed {} does not exist", feed_id))?;
            TokenScope::FeedScoped(feed_id)
        }
        None => TokenScope::Combined,
    };

    let issued = Authorizer::new(db).issue_token(principal, scope)?;
    println!("feed_token={}", issued.token_id);
    println!("feed_secret={}", issued.secret);
    Ok(())
}

/// Load a value from the .env file by key name
pub fn load_env_value(project_dir: &std::path::Path, key: &str) -> Option<String> {
    let env_path = project_dir.join(".env");
    let prefix = format!("{}=", key);
    if let Ok(content) = std::fs::read_to_string(&env_path) {
        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(&prefix) {
                let value = rest.trim().trim_matches('"').trim_matches('\'');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
