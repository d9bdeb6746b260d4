//! Application configuration, parsed from environment variables.
//!
//! Every knob has a default except `DATABASE_URL`. Malformed values are a
//! startup error rather than a silent fallback.

use std::str::FromStr;

const DEFAULT_USER_AGENT: &str = "RaceWeather/0.1 github.com/race-weather/race-weather-api";
const DEFAULT_YR_BASE_URL: &str = "https://api.met.no";
/// Slowest pace the poller's arrival bands accept.
const MIN_POLLER_SPEED_KMH: f64 = 1.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// yr.no client and cache-freshness settings.
#[derive(Debug, Clone)]
pub struct YrConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Upper bound on every upstream call, including the body download.
    pub timeout_secs: u64,
    /// Expiry applied when a 200 response carries no usable `Expires` header.
    pub default_expiry_secs: i64,
    /// How far a 304 pushes the snapshot's expiry forward.
    pub not_modified_extension_secs: i64,
}

/// Background poller schedule and retry settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub enabled: bool,
    pub min_sleep_secs: u64,
    pub max_sleep_secs: u64,
    /// Added after the earliest snapshot expiry before waking.
    pub wakeup_buffer_secs: u64,
    /// Sleep used when no upcoming race is tracked.
    pub idle_sleep_secs: u64,
    pub retry_delay_secs: u64,
    pub max_retries: u32,
    pub lookahead_days: i64,
    /// Slowest plausible pace, bounds the latest arrival band.
    pub min_speed_kmh: f64,
    /// Fastest plausible pace, bounds the earliest arrival band.
    pub max_speed_kmh: f64,
}

/// Tuned coefficients of the elevation-adjusted pacing model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingCoefficients {
    /// Uphill cost per unit gradient (m/m). A 5% climb costs 1.6x per km.
    pub k_up: f64,
    /// Downhill relief per unit gradient (m/m). A 5% descent costs 0.8x per km.
    pub k_down: f64,
    /// Floor on the per-km cost factor; steep descents are never free.
    pub min_cost_factor: f64,
}

impl Default for PacingCoefficients {
    fn default() -> Self {
        Self {
            k_up: 12.0,
            k_down: 4.0,
            min_cost_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub yr: YrConfig,
    pub poller: PollerConfig,
    pub pacing: PacingCoefficients,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let pacing_defaults = PacingCoefficients::default();

        let config = Self {
            database_url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            port: env.parse("PORT", 8080)?,
            log_format: env.parse("LOG_FORMAT", LogFormat::Pretty)?,
            yr: YrConfig {
                base_url: lookup("YR_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_YR_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                user_agent: lookup("YR_USER_AGENT")
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
                timeout_secs: env.parse("YR_TIMEOUT_SECS", 30)?,
                default_expiry_secs: env.parse("YR_DEFAULT_EXPIRY_SECS", 3600)?,
                not_modified_extension_secs: env.parse("YR_NOT_MODIFIED_EXTENSION_SECS", 600)?,
            },
            poller: PollerConfig {
                enabled: env.parse("POLLER_ENABLED", true)?,
                min_sleep_secs: env.parse("POLLER_MIN_SLEEP_SECS", 60)?,
                max_sleep_secs: env.parse("POLLER_MAX_SLEEP_SECS", 1800)?,
                wakeup_buffer_secs: env.parse("POLLER_WAKEUP_BUFFER_SECS", 30)?,
                idle_sleep_secs: env.parse("POLLER_IDLE_SLEEP_SECS", 3600)?,
                retry_delay_secs: env.parse("POLLER_RETRY_DELAY_SECS", 120)?,
                max_retries: env.parse("POLLER_MAX_RETRIES", 5)?,
                lookahead_days: env.parse("POLLER_LOOKAHEAD_DAYS", 10)?,
                min_speed_kmh: env.parse("POLLER_MIN_SPEED_KMH", 10.0)?,
                max_speed_kmh: env.parse("POLLER_MAX_SPEED_KMH", 30.0)?,
            },
            pacing: PacingCoefficients {
                k_up: env.parse("PACING_K_UP", pacing_defaults.k_up)?,
                k_down: env.parse("PACING_K_DOWN", pacing_defaults.k_down)?,
                min_cost_factor: env
                    .parse("PACING_MIN_COST_FACTOR", pacing_defaults.min_cost_factor)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poller.min_sleep_secs > self.poller.max_sleep_secs {
            return Err(ConfigError::Invalid {
                key: "POLLER_MIN_SLEEP_SECS",
                value: format!(
                    "{} (greater than POLLER_MAX_SLEEP_SECS {})",
                    self.poller.min_sleep_secs, self.poller.max_sleep_secs
                ),
            });
        }
        if !(self.poller.min_speed_kmh >= MIN_POLLER_SPEED_KMH
            && self.poller.min_speed_kmh <= self.poller.max_speed_kmh)
        {
            return Err(ConfigError::Invalid {
                key: "POLLER_MIN_SPEED_KMH",
                value: format!(
                    "{} (must be at least {MIN_POLLER_SPEED_KMH} and at most POLLER_MAX_SPEED_KMH {})",
                    self.poller.min_speed_kmh, self.poller.max_speed_kmh
                ),
            });
        }
        if !self.poller.max_speed_kmh.is_finite() {
            return Err(ConfigError::Invalid {
                key: "POLLER_MAX_SPEED_KMH",
                value: self.poller.max_speed_kmh.to_string(),
            });
        }
        if !(self.pacing.min_cost_factor > 0.0) {
            return Err(ConfigError::Invalid {
                key: "PACING_MIN_COST_FACTOR",
                value: self.pacing.min_cost_factor.to_string(),
            });
        }
        Ok(())
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
        }
    }
}
