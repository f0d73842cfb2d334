//! Process configuration: loading from a TOML file (with environment variable
//! overrides), validation, and the well-known label keys/values that make up
//! the opt-in surface described on controllers.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default location searched for the config file if none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chaos-scheduler/config.toml";

/// Environment variables override config file values when prefixed with this and with `.`
/// replaced by `_`, e.g. `CHAOS_RUN_HOUR=9`.
const ENV_PREFIX: &str = "CHAOS";

/// Label applied to a controller to mark it enrolled for chaos.
pub const ENABLED_LABEL_KEY: &str = "chaos-scheduler/enabled";
/// Required value of [`ENABLED_LABEL_KEY`] for a controller to be considered opted in.
pub const ENABLED_LABEL_VALUE: &str = "enabled";
/// Label carrying the unique identifier propagated from controller to pod template.
pub const IDENT_LABEL_KEY: &str = "chaos-scheduler/identifier";
/// Label carrying the mean-time-between-failures value.
pub const MTBF_LABEL_KEY: &str = "chaos-scheduler/mtbf";
/// Label naming the kill mode to apply at attack time.
pub const KILL_TYPE_LABEL_KEY: &str = "chaos-scheduler/kill-mode";
/// Label carrying the numeric parameter for kill modes that need one.
pub const KILL_VALUE_LABEL_KEY: &str = "chaos-scheduler/kill-value";

/// Errors that can occur while loading or validating [`Config`]. All are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The underlying `config` crate failed to read or parse the config source.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    /// An hour-of-day field was outside `[0, 23]`.
    #[error("{field}: {value} is outside the valid range of [0, 23]")]
    InvalidHour {
        /// Name of the offending field.
        field: &'static str,
        /// The out-of-range value.
        value: i64,
    },
    /// The `runHour < startHour < endHour` ordering invariant was violated.
    #[error("run_hour ({run_hour}) must be less than start_hour ({start_hour}), which must be less than end_hour ({end_hour})")]
    HourOrdering {
        /// Configured run hour.
        run_hour: u32,
        /// Configured start hour.
        start_hour: u32,
        /// Configured end hour.
        end_hour: u32,
    },
    /// A notification header was not in `key:value` form.
    #[error("notification header {0:?} is not in 'key:value' format")]
    InvalidHeader(String),
    /// The configured timezone name could not be resolved against the IANA database.
    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

/// A single notification receiver: where to send attack reports and how to render them.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct Receiver {
    /// URL the notifier POSTs to.
    #[serde(default)]
    pub endpoint: String,
    /// Message template; supports `{$name}`, `{$kind}`, `{$namespace}`, `{$error}`,
    /// `{$timestamp}`, `{$time}`, `{$date}` placeholders.
    #[serde(default)]
    pub message: String,
    /// Raw `key:value` header strings; `{$env:VAR}` placeholders are resolved at send time.
    #[serde(default)]
    pub headers: Vec<String>,
}

/// Debug-only overrides used to shorten feedback loops in development.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Master switch for the debug overrides below.
    pub enabled: bool,
    /// Replaces the business-day wait with a fixed delay, in seconds.
    pub schedule_delay_sec: u64,
    /// Bypasses the MTBF-weighted probability gate; every eligible victim is scheduled.
    pub force_should_kill: bool,
    /// Replaces computed kill instants with `now + U[0, 60s)`.
    pub schedule_immediate_kill: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule_delay_sec: 30,
            force_should_kill: false,
            schedule_immediate_kill: false,
        }
    }
}

/// Notification settings.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Master switch; when false, no HTTP calls are made.
    pub enabled: bool,
    /// When true, also POST the rendered schedule once per day.
    pub report_schedule: bool,
    /// Receiver used for per-attack reports.
    pub attacks: Receiver,
}

/// Immutable, validated process configuration. Built once at startup via [`Config::load`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// When true, pod deletions are suppressed (logged, not executed).
    pub dry_run: bool,
    /// IANA timezone name the calendar operates in.
    pub timezone: String,
    /// Hour of day (local to `timezone`) the daily schedule is built.
    pub run_hour: u32,
    /// Start of the window within which kill instants are chosen.
    pub start_hour: u32,
    /// End of the window (exclusive) within which kill instants are chosen.
    pub end_hour: u32,
    /// Floor, in seconds, for the grace period given to terminated pods.
    pub grace_period_sec: i64,
    /// Namespaces that are never eligible, regardless of opt-in labels.
    pub blacklisted_namespaces: BTreeSet<String>,
    /// Namespaces that are eligible; empty means "all namespaces".
    pub whitelisted_namespaces: BTreeSet<String>,
    /// Optional override of the cluster API server host (bypassing kubeconfig discovery).
    pub cluster_api_server_host: Option<String>,
    /// Development-time scheduling overrides.
    pub debug: DebugConfig,
    /// Notification settings.
    pub notifications: NotificationsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: true,
            timezone: "America/Los_Angeles".to_string(),
            run_hour: 8,
            start_hour: 10,
            end_hour: 16,
            grace_period_sec: 5,
            blacklisted_namespaces: ["kube-system".to_string()].into_iter().collect(),
            whitelisted_namespaces: BTreeSet::new(),
            cluster_api_server_host: None,
            debug: DebugConfig::default(),
            notifications: NotificationsConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (if it exists) layered with `CHAOS_*` environment
    /// variables, validates the result, and returns it. Any failure here should be treated
    /// as fatal by the caller.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let defaults = Config::default();
        let mut builder = config::Config::builder()
            .set_default("dry_run", defaults.dry_run)?
            .set_default("timezone", defaults.timezone.clone())?
            .set_default("run_hour", defaults.run_hour as i64)?
            .set_default("start_hour", defaults.start_hour as i64)?
            .set_default("end_hour", defaults.end_hour as i64)?
            .set_default("grace_period_sec", defaults.grace_period_sec)?
            .set_default(
                "blacklisted_namespaces",
                defaults
                    .blacklisted_namespaces
                    .into_iter()
                    .collect::<Vec<_>>(),
            )?
            .set_default("whitelisted_namespaces", Vec::<String>::new())?;

        if path.exists() {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("_"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the hour-range invariants and notification header syntax, returning the first
    /// violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("run_hour", self.run_hour),
            ("start_hour", self.start_hour),
            ("end_hour", self.end_hour),
        ] {
            if value > 23 {
                return Err(ConfigError::InvalidHour {
                    field,
                    value: value as i64,
                });
            }
        }

        if !(self.run_hour < self.start_hour && self.start_hour < self.end_hour) {
            return Err(ConfigError::HourOrdering {
                run_hour: self.run_hour,
                start_hour: self.start_hour,
                end_hour: self.end_hour,
            });
        }

        for header in &self.notifications.attacks.headers {
            if !is_valid_header(header) {
                return Err(ConfigError::InvalidHeader(header.clone()));
            }
        }

        self.timezone_or_err()?;

        Ok(())
    }

    /// Resolves [`Config::timezone`] against the IANA database.
    pub fn timezone_or_err(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    /// True if at least one namespace has been explicitly whitelisted.
    pub fn whitelist_enabled(&self) -> bool {
        !self.whitelisted_namespaces.is_empty()
    }

    /// The namespaces to enumerate when searching for eligible victims: the whitelist if
    /// set, otherwise a single-element "all namespaces" marker handled by the caller.
    pub fn search_namespaces(&self) -> Vec<String> {
        self.whitelisted_namespaces.iter().cloned().collect()
    }
}

fn is_valid_header(header: &str) -> bool {
    match header.split_once(':') {
        Some((k, v)) => !k.trim().is_empty() && !v.trim().is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_window() {
        let cfg = Config {
            run_hour: 10,
            start_hour: 8,
            end_hour: 16,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HourOrdering { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_hour() {
        let cfg = Config {
            end_hour: 25,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidHour { .. })));
    }

    #[test]
    fn rejects_malformed_header() {
        let mut cfg = Config::default();
        cfg.notifications.attacks.headers.push("no-colon-here".to_string());
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidHeader(_))));
    }

    #[test]
    fn accepts_wellformed_header() {
        let mut cfg = Config::default();
        cfg.notifications.attacks.headers.push("Authorization: Bearer xyz".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let cfg = Config {
            timezone: "Not/A_Zone".to_string(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownTimezone(_))));
    }
}
