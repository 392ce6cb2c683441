use hydracord::config::{init_logging, Config};
use hydracord::db::Database;
use hydracord::{fleet, Shared};
use std::path::Path;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_logging(&config);
    info!("Starting hydracord...");

    if let Some(parent) = Path::new(&config.database_url).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::new(&config.database_url)?;
    db.execute_init()?;

    let shared = Shared::new(config, db);
    fleet::run(shared).await
}
