use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::errors::EngineError;

/// When two submissions for the same center/category/source are suspected duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicatePolicy {
    /// Maximum relative difference between totals, in percent.
    pub tolerance_pct: f64,
    /// Submissions by different actors closer than this always conflict.
    pub conflict_window: Duration,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            tolerance_pct: 2.0,
            conflict_window: Duration::minutes(60),
        }
    }
}

/// Percentage bands used to classify internal vs official totals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconThresholds {
    pub match_pct: f64,
    pub minor_pct: f64,
}

impl Default for ReconThresholds {
    fn default() -> Self {
        Self {
            match_pct: 2.0,
            minor_pct: 10.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub duplicates: DuplicatePolicy,
    pub thresholds: ReconThresholds,
    pub admin_ids: Vec<String>,
    pub reconcile_interval: StdDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:trusty_tally.db".to_string(),
            max_connections: 5,
            duplicates: DuplicatePolicy::default(),
            thresholds: ReconThresholds::default(),
            admin_ids: Vec::new(),
            reconcile_interval: StdDuration::from_secs(300),
        }
    }
}

impl Config {
    /// Load from `.env` and the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url);
        let max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.max_connections)?;
        let tolerance_pct = parse_or(&lookup, "DUPLICATE_TOLERANCE_PCT", defaults.duplicates.tolerance_pct)?;
        let window_minutes: i64 = parse_or(&lookup, "DUPLICATE_WINDOW_MINUTES", 60)?;
        let match_pct = parse_or(&lookup, "RECON_MATCH_PCT", defaults.thresholds.match_pct)?;
        let minor_pct = parse_or(&lookup, "RECON_MINOR_PCT", defaults.thresholds.minor_pct)?;
        let interval_secs: u64 = parse_or(&lookup, "RECONCILE_INTERVAL_SECONDS", 300)?;

        let admin_ids = lookup("ADMIN_USER_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        if max_connections == 0 {
            return Err(EngineError::Config("DATABASE_MAX_CONNECTIONS must be at least 1".into()));
        }
        for (key, pct) in [
            ("DUPLICATE_TOLERANCE_PCT", tolerance_pct),
            ("RECON_MATCH_PCT", match_pct),
            ("RECON_MINOR_PCT", minor_pct),
        ] {
            // NaN compares false against everything, so check finiteness first
            if !pct.is_finite() || pct < 0.0 {
                return Err(EngineError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    key, pct
                )));
            }
        }
        if match_pct > minor_pct {
            return Err(EngineError::Config(format!(
                "RECON_MATCH_PCT ({}) must not exceed RECON_MINOR_PCT ({})",
                match_pct, minor_pct
            )));
        }
        let conflict_window = match Duration::try_minutes(window_minutes) {
            Some(window) if window_minutes >= 0 => window,
            _ => {
                return Err(EngineError::Config(format!(
                    "DUPLICATE_WINDOW_MINUTES must be between 0 and {} minutes, got {}",
                    Duration::MAX.num_minutes(),
                    window_minutes
                )));
            }
        };
        if interval_secs == 0 {
            return Err(EngineError::Config("RECONCILE_INTERVAL_SECONDS must be at least 1".into()));
        }

        Ok(Self {
            database_url,
            max_connections,
            duplicates: DuplicatePolicy {
                tolerance_pct,
                conflict_window,
            },
            thresholds: ReconThresholds { match_pct, minor_pct },
            admin_ids,
            reconcile_interval: StdDuration::from_secs(interval_secs),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, EngineError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("{} has an invalid value: {:?}", key, raw))),
        None => Ok(default),
    }
}
