use dotenvy::dotenv;
use std::env;

/// Process-level configuration. Everything guild-scoped lives in the
/// settings store, not here.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub short_logs: bool,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/hydracord.db".to_string()),
            short_logs: env::var("SHORT_LOGS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

/// Initialize tracing from the process config. `short_logs` drops targets
/// and timestamps for environments that already prefix log lines.
pub fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    if config.short_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_defaults() {
        env::remove_var("DATABASE_URL");
        env::remove_var("SHORT_LOGS");
        env::remove_var("LOG_LEVEL");

        let config = Config::build().unwrap();
        assert_eq!(config.database_url, "data/hydracord.db");
        assert!(!config.short_logs);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_overrides() {
        env::set_var("DATABASE_URL", ":memory:");
        env::set_var("SHORT_LOGS", "true");
        env::set_var("LOG_LEVEL", "debug");

        let config = Config::build().unwrap();
        assert_eq!(config.database_url, ":memory:");
        assert!(config.short_logs);
        assert_eq!(config.log_level, "debug");

        env::remove_var("DATABASE_URL");
        env::remove_var("SHORT_LOGS");
        env::remove_var("LOG_LEVEL");
    }
}
