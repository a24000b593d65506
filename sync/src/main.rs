//! WorkSpot client - query workspaces through the offline-first cache.
//!
//! ```text
//! workspot nearby <lat> <lon> <radius_m>
//! workspot get <id>
//! workspot saved
//! ```

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspot_engine::Coordinate;
use workspot_sync::{ClientConfig, HttpGateway, LocalStore, SqliteBackend, SyncEngine};

const USAGE: &str = "usage: workspot nearby <lat> <lon> <radius_m> | get <id> | saved";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workspot_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = ClientConfig::from_env()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command: Vec<&str> = args.iter().map(String::as_str).collect();

    tracing::info!("Opening local store at {}", config.database_url);
    let backend = SqliteBackend::connect(&config.database_url).await?;
    let store = Arc::new(LocalStore::open(Arc::new(backend)).await?);
    let gateway = Arc::new(HttpGateway::new(
        &config.remote_url,
        config.sync.remote_timeout,
    )?);
    let engine = SyncEngine::start(store, gateway, config.sync.clone());

    let output = match command.as_slice() {
        ["nearby", lat, lon, radius] => {
            let center = Coordinate::new(lat.parse()?, lon.parse()?)?;
            let records = engine.nearby(center, radius.parse()?).await?;
            serde_json::to_string_pretty(&records)?
        }
        ["get", id] => serde_json::to_string_pretty(&engine.get_record(id).await?)?,
        ["saved"] => {
            if let Err(err) = engine.refresh_saved().await {
                tracing::warn!(error = %err, "Could not refresh saved workspaces");
            }
            serde_json::to_string_pretty(&engine.saved().await?)?
        }
        _ => {
            engine.shutdown().await;
            return Err(USAGE.into());
        }
    };

    println!("{output}");
    engine.shutdown().await;
    Ok(())
}
