mod config;
mod db;
mod ingest;
mod live;
mod normalize;
mod state;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tracing_subscriber::EnvFilter;

use db::Db;
use ingest::Pipeline;
use live::LiveFeed;
use normalize::Normalizer;
use state::HubState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.storage.db_url).await?;
    db.migrate().await?;
    tracing::info!(records = db.count().await?, "db ready");

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = HubState::shared();
    shared.write().await.record_system("hub started".to_string());

    let pipeline = Pipeline::new(
        db,
        LiveFeed::new(),
        shared,
        Normalizer::new(&cfg.ingest.default_garden_id),
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = ingest::connect(&cfg.mqtt);
    tracing::info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        "ingestion worker starting"
    );
    tokio::spawn(ingest::run(
        client.clone(),
        eventloop,
        pipeline.clone(),
        cfg.mqtt.clone(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        pipeline,
        commands: Arc::new(client),
        recent_limit: cfg.storage.recent_limit,
        command_prefix: cfg.mqtt.command_prefix.clone(),
    };
    web::serve(app, cfg.web.port).await
}
