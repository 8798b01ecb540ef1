use std::sync::Arc;
use std::time::Duration;

use mconf_center::{Mconf, Notification, Notify, NotifyError};
use mconf_core::MconfSettings;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "zookeeper://127.0.0.1:2181/mconf?node=demo-node&app=billing&env=dev&conf=database";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,mconf_center=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Optional settings file as the first argument
    let settings = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!("Loading settings from {}", path);
            MconfSettings::load(&path)?
        }
        None => MconfSettings::default(),
    };
    let url = std::env::var("MCONF_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

    let center = Mconf::connect_in_memory(&url, settings).await?;

    let printer: Arc<dyn Notify> = Arc::new(|n: &Notification| -> Result<(), NotifyError> {
        let value = n
            .value
            .as_ref()
            .map_or_else(|| "<deleted>".to_string(), |v| v.to_string());
        tracing::info!("{:?} {} = {}", n.kind, n.cmd, value);
        Ok(())
    });
    let scope = center.cmd().build()?;
    let subscription = center.push(&scope, printer).await?;
    tracing::info!("Subscribed {} to {}", subscription.id(), subscription.pattern());

    let pool = center.cmd().group("pool").version("1.0.0").data("primary").build()?;
    let timeout = center.cmd().group("pool").version("1.0.0").data("timeout").build()?;

    center.add_conf(&pool, &json!({"host": "db.internal", "size": 8})).await?;
    center.add_conf(&timeout, &30).await?;
    center.up_conf(&pool, &json!({"host": "db.internal", "size": 16})).await?;

    let size: serde_json::Value = center.pull(&pool).await?;
    tracing::info!("Pool is now {}", size);

    println!("{}", serde_json::to_string_pretty(&center.structures().await?)?);
    println!("{}", serde_json::to_string_pretty(&center.kv_datas().await?)?);

    center.del_conf(&timeout).await?;
    center.flush().await?;

    // Let the dispatch task print the last notifications
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("{}", serde_json::to_string_pretty(&center.statistics().await)?);
    center.close().await;

    Ok(())
}
