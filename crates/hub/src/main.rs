use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use garden_hub::cloud::CloudClient;
use garden_hub::config;
use garden_hub::coordinator::{GardenRegistry, GardenServices};
use garden_hub::db::Db;
use garden_hub::mqtt::MqttSensorSource;
use garden_hub::sources::Backend;
use garden_hub::web;

/// Live collaborators: MQTT telemetry, the cloud API and SQLite.
struct HubBackend;

impl Backend for HubBackend {
    type Sensors = MqttSensorSource;
    type Alerts = CloudClient;
    type Ai = CloudClient;
    type Schedules = Db;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let tuning = cfg.tuning();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;
    info!(url = %cfg.database.url, "schedule store ready");

    // ── Cloud (alerts + AI) ─────────────────────────────────────────
    let cloud = Arc::new(
        CloudClient::new(
            &cfg.cloud.base_url,
            cfg.cloud.api_token.as_deref(),
            tuning.request_timeout,
        )
        .context("failed to set up cloud client")?,
    );

    // ── MQTT ────────────────────────────────────────────────────────
    let sensors = Arc::new(MqttSensorSource::new());
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    tokio::spawn(Arc::clone(&sensors).run(client, eventloop));
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "mqtt event loop started");

    // ── Gardens ─────────────────────────────────────────────────────
    let services = GardenServices::<HubBackend>::new(
        sensors,
        Arc::clone(&cloud),
        cloud,
        Arc::new(db),
        tuning,
    );
    let registry = Arc::new(GardenRegistry::new(services));

    let gateway = Arc::clone(registry.gateway());
    tokio::spawn(async move {
        if !gateway.test_connection().await {
            warn!("ai service unreachable at startup; manual scheduling only until re-tested");
        }
    });

    for garden_id in &cfg.hub.gardens {
        registry
            .get_or_open(garden_id)
            .await
            .with_context(|| format!("failed to open garden '{garden_id}'"))?;
    }

    // ── Web server ──────────────────────────────────────────────────
    tokio::select! {
        res = web::serve(Arc::clone(&registry), cfg.hub.web_port) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    registry.close_all().await;
    info!("hub stopped");
    Ok(())
}
