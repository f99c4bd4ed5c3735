use std::str::FromStr;
use std::sync::Arc;

use pipeline_sentinel::config::SentinelConfig;
use pipeline_sentinel::store::LibSqlStore;
use pipeline_sentinel::tick::Sentinel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SentinelConfig::from_env();

    let db_path = std::env::var("SENTINEL_DB_PATH")
        .unwrap_or_else(|_| "./data/pipeline-sentinel.db".to_string());

    // Six-field cron (sec min hour dom mon dow); default every 5 minutes.
    let schedule_str =
        std::env::var("SENTINEL_CRON").unwrap_or_else(|_| "0 */5 * * * *".to_string());
    let schedule = cron::Schedule::from_str(&schedule_str).unwrap_or_else(|e| {
        eprintln!("Error: invalid SENTINEL_CRON '{}': {}", schedule_str, e);
        std::process::exit(1);
    });

    eprintln!("🛰  Pipeline Sentinel v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Environment: {}", config.environment);
    eprintln!("   Release: {}", config.release);
    eprintln!("   Schedule: {}", schedule_str);
    eprintln!("   Database: {}\n", db_path);

    let db_path_ref = std::path::Path::new(&db_path);
    let store = Arc::new(LibSqlStore::new_local(db_path_ref).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open database at {}: {}", db_path, e);
        std::process::exit(1);
    }));

    let release = config.release.clone();
    let sentinel = Sentinel::with_store(store, config);
    sentinel
        .record_deploy(&format!("pipeline-sentinel {release} started"))
        .await;

    loop {
        let Some(next) = schedule.upcoming(chrono::Utc).next() else {
            tracing::warn!("Cron schedule has no upcoming fires; exiting");
            break;
        };
        let wait = (next - chrono::Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;

        let report = sentinel.run_tick().await;
        if !report.ok {
            for error in &report.errors {
                tracing::warn!(error = %error, "Tick phase error");
            }
        }
    }

    Ok(())
}
