//! Process configuration
//!
//! Every setting is a CLI flag with an environment fallback; `.env` files are
//! loaded first so either source works.

use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::deposit::DepositSettings;
use crate::gateway::zapupi::DEFAULT_BASE_URL;
use crate::gateway::ZapupiConfig;
use crate::leaderboard::LeaderboardSettings;
use crate::middleware::RateLimitConfig;
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GatewayMode {
    Zapupi,
    Sandbox,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "elitepros")]
#[command(about = "ElitePros wallet ledger and contest settlement service")]
pub struct Config {
    /// Address the HTTP API binds to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: String,

    #[arg(long, env = "STORE", value_enum, default_value = "sqlite")]
    pub store: StoreMode,

    /// Relative paths resolve against the crate directory
    #[arg(long, env = "LEDGER_DB_PATH")]
    pub ledger_db_path: Option<String>,

    #[arg(long, env = "JWT_SECRET", default_value = "dev-secret-change-in-production-minimum-32-characters")]
    pub jwt_secret: String,

    #[arg(long, env = "GATEWAY_MODE", value_enum, default_value = "zapupi")]
    pub gateway: GatewayMode,

    #[arg(long, env = "ZAPUPI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub zapupi_base_url: String,

    #[arg(long, env = "ZAPUPI_API_KEY", default_value = "")]
    pub zapupi_api_key: String,

    #[arg(long, env = "ZAPUPI_SECRET_KEY", default_value = "")]
    pub zapupi_secret_key: String,

    #[arg(long, env = "GATEWAY_TIMEOUT_SECS", default_value = "10")]
    pub gateway_timeout_secs: u64,

    /// HMAC secret for webhook signatures; unsigned webhooks are accepted when empty
    #[arg(long, env = "WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    /// Confirm webhook claims against the gateway's order status
    #[arg(long, env = "WEBHOOK_RECHECK", default_value = "true", action = clap::ArgAction::Set)]
    pub webhook_recheck: bool,

    /// Minimum deposit in major units
    #[arg(long, env = "MIN_DEPOSIT", default_value = "1")]
    pub min_deposit: String,

    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "300")]
    pub reconcile_interval_secs: u64,

    /// Age after which a lease, lock or reservation counts as abandoned
    #[arg(long, env = "STALE_AFTER_SECS", default_value = "120")]
    pub stale_after_secs: u64,

    #[arg(long, env = "LEADERBOARD_TICK_SECS", default_value = "60")]
    pub leaderboard_tick_secs: u64,

    /// Offset of the local day used for leaderboard periods (+05:30 = 330)
    #[arg(long, env = "LEADERBOARD_UTC_OFFSET_MINUTES", default_value = "330", allow_hyphen_values = true)]
    pub leaderboard_utc_offset_minutes: i32,

    #[arg(long, env = "LEADERBOARD_TOP_N", default_value = "10")]
    pub leaderboard_top_n: usize,

    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value = "120")]
    pub rate_limit_per_minute: u32,

    /// Budget for deposit orders, contest joins and withdrawal requests.
    #[arg(long, env = "RATE_LIMIT_MONEY_PER_MINUTE", default_value = "20")]
    pub rate_limit_money_per_minute: u32,

    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "30")]
    pub rate_limit_burst: u32,
}

impl Config {
    pub fn stale_after_ms(&self) -> i64 {
        i64::try_from(self.stale_after_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    pub fn ledger_db_path(&self) -> String {
        resolve_data_path(self.ledger_db_path.clone(), "elitepros_ledger.db")
    }

    pub fn deposit_settings(&self) -> anyhow::Result<DepositSettings> {
        let min_amount = Amount::parse_major(&self.min_deposit)
            .map_err(|e| anyhow::anyhow!("Invalid MIN_DEPOSIT {:?}: {}", self.min_deposit, e))?;
        Ok(DepositSettings {
            min_amount,
            gateway_timeout: Duration::from_secs(self.gateway_timeout_secs),
            webhook_recheck: self.webhook_recheck,
        })
    }

    pub fn leaderboard_settings(&self) -> LeaderboardSettings {
        LeaderboardSettings {
            top_n: self.leaderboard_top_n,
            utc_offset_minutes: self.leaderboard_utc_offset_minutes,
            stale_after_ms: self.stale_after_ms(),
        }
    }

    /// Credentials for the live gateway. Missing keys stop startup.
    pub fn zapupi(&self) -> anyhow::Result<ZapupiConfig> {
        if self.zapupi_api_key.trim().is_empty() || self.zapupi_secret_key.trim().is_empty() {
            anyhow::bail!(
                "ZAPUPI_API_KEY and ZAPUPI_SECRET_KEY are required with --gateway zapupi \
                 (use --gateway sandbox for local runs)"
            );
        }
        Ok(ZapupiConfig {
            base_url: self.zapupi_base_url.clone(),
            token_key: self.zapupi_api_key.clone(),
            secret_key: self.zapupi_secret_key.clone(),
            timeout: Duration::from_secs(self.gateway_timeout_secs),
        })
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit_per_minute,
            max_money_requests: self.rate_limit_money_per_minute,
            window: Duration::from_secs(60),
            burst: self.rate_limit_burst,
        }
    }

    pub fn webhook_secret(&self) -> Option<String> {
        self.webhook_secret
            .clone()
            .filter(|s| !s.trim().is_empty())
    }
}

fn default_data_path(filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}

pub fn load_env() {
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for p in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
