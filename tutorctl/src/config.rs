//! Configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` and can be changed with `-f` or the `TUTORCTL_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! Later sources override earlier ones:
//!
//! 1. **YAML config file** (default: `config.yaml`)
//! 2. **Environment variables** prefixed with `TUTORCTL_`; nested keys use double underscores,
//!    e.g. `TUTORCTL_SCHEDULING__CANCELLATION_WINDOW=12h`
//! 3. **DATABASE_URL**: overrides `database.url` if set
//!
//! ## Example
//!
//! ```yaml
//! database:
//!   url: postgres://localhost/tutorctl
//!   pool:
//!     max_connections: 20
//! scheduling:
//!   cancellation_window: 24h
//!   operation_timeout: 30s
//!   utc_offset_minutes: 180
//! ```

use chrono::FixedOffset;
use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::Error;

/// CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TUTORCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operator commands. Each runs one core operation and exits.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Instantiate a template for one week
    ApplyTemplate {
        /// Acting admin or methodologist
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        template: Uuid,
        /// Monday of the target week (YYYY-MM-DD)
        #[arg(long)]
        week: chrono::NaiveDate,
        /// Run every step and report the stats, then discard the changes
        #[arg(long)]
        dry_run: bool,
    },
    /// Undo a template application
    Rollback {
        #[arg(long)]
        actor: Uuid,
        #[arg(long)]
        template: Uuid,
        #[arg(long)]
        week: chrono::NaiveDate,
    },
    /// Print a user's credit balance
    Balance {
        #[arg(long)]
        user: Uuid,
    },
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Set from the raw `DATABASE_URL` environment variable; folded into `database.url` on load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub database: DatabaseConfig,
    pub scheduling: SchedulingConfig,
    /// Apply embedded migrations when the store connects
    pub run_migrations: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database: DatabaseConfig::default(),
            scheduling: SchedulingConfig::default(),
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool: PoolSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/tutorctl".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

/// Connection pool parameters passed straight to sqlx.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds, 0 = never)
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection (seconds, 0 = never)
    pub max_lifetime_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

/// Scheduling rules shared by every engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulingConfig {
    /// Cancelling earlier than this before the lesson starts refunds the booking
    #[serde(with = "humantime_serde")]
    pub cancellation_window: Duration,
    /// Upper bound on one operation, including waiting for row locks
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
    /// Offset of the wall clock that template times and bulk-edit patterns refer to
    pub utc_offset_minutes: i32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            cancellation_window: Duration::from_secs(24 * 60 * 60),
            operation_timeout: Duration::from_secs(30),
            utc_offset_minutes: 0,
        }
    }
}

impl SchedulingConfig {
    /// Offset used to turn template times of day into instants.
    pub fn offset(&self) -> Result<FixedOffset, Error> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or_else(|| Error::invalid("scheduling.utc_offset_minutes", format!("{} is out of range", self.utc_offset_minutes)))
    }

    pub fn cancellation_window(&self) -> Result<chrono::Duration, Error> {
        chrono::Duration::from_std(self.cancellation_window)
            .map_err(|e| Error::invalid("scheduling.cancellation_window", e.to_string()))
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(url) = config.database_url.take() {
            config.database.url = url;
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.database.url.trim().is_empty() {
            return Err(Error::invalid("database.url", "must not be empty"));
        }

        let pool = &self.database.pool;
        if pool.max_connections == 0 {
            return Err(Error::invalid("database.pool.max_connections", "must be at least 1"));
        }
        if pool.min_connections > pool.max_connections {
            return Err(Error::invalid(
                "database.pool.min_connections",
                format!(
                    "min_connections ({}) cannot be greater than max_connections ({})",
                    pool.min_connections, pool.max_connections
                ),
            ));
        }

        if self.scheduling.operation_timeout.is_zero() {
            return Err(Error::invalid("scheduling.operation_timeout", "must be greater than zero"));
        }
        if self.scheduling.cancellation_window.is_zero() {
            return Err(Error::invalid("scheduling.cancellation_window", "must be greater than zero"));
        }
        if self.scheduling.utc_offset_minutes.abs() > 14 * 60 {
            return Err(Error::invalid(
                "scheduling.utc_offset_minutes",
                format!("{} is outside -840..=840", self.scheduling.utc_offset_minutes),
            ));
        }
        self.scheduling.cancellation_window()?;

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // TUTORCTL_CONFIG names the file itself and is not a config key
            .merge(Env::prefixed("TUTORCTL_").ignore(&["CONFIG"]).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }
}
