use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use turnstile_core::liveness::DEFAULT_MIN_LIVENESS_CONFIDENCE;
use turnstile_core::matcher::DEFAULT_MATCH_THRESHOLD;
use turnstile_core::Geofence;

/// Largest distance between two unit vectors.
const MAX_MATCH_THRESHOLD: f32 = 2.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read premises file {path}: {source}")]
    PremisesRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad premises TOML in {path}: {source}")]
    PremisesParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which D-Bus bus to own the service name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// A supervisor who receives spoof alerts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Supervisor {
    pub name: String,
    pub contact: String,
}

/// Site description loaded from `TURNSTILE_PREMISES_FILE`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Premises {
    pub geofence: Option<Geofence>,
    #[serde(default)]
    pub supervisors: Vec<Supervisor>,
}

impl Premises {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::PremisesRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&src).map_err(|source| ConfigError::PremisesParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum normalized Euclidean distance for a face match.
    pub match_threshold: f32,
    /// Minimum client-reported liveness confidence.
    pub min_liveness_confidence: f32,
    /// Upper bound on a single log-store read or write.
    pub persist_timeout: Duration,
    /// Reference timezone for calendar days.
    pub timezone: FixedOffset,
    /// Capacity of the spoof alert queue.
    pub alert_queue: usize,
    pub bus: BusKind,
    pub premises: Premises,
}

impl Config {
    /// Load configuration from `TURNSTILE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("turnstile");

        let db_path = std::env::var("TURNSTILE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let premises = match std::env::var("TURNSTILE_PREMISES_FILE") {
            Ok(path) => Premises::load(Path::new(&path))?,
            Err(_) => Premises::default(),
        };

        Ok(Self {
            db_path,
            match_threshold: env_bounded_f32(
                "TURNSTILE_MATCH_THRESHOLD",
                DEFAULT_MATCH_THRESHOLD,
                MAX_MATCH_THRESHOLD,
            ),
            min_liveness_confidence: env_bounded_f32(
                "TURNSTILE_MIN_LIVENESS_CONFIDENCE",
                DEFAULT_MIN_LIVENESS_CONFIDENCE,
                1.0,
            ),
            persist_timeout: Duration::from_millis(env_u64("TURNSTILE_PERSIST_TIMEOUT_MS", 2000)),
            timezone: offset_from_minutes(env_i32("TURNSTILE_UTC_OFFSET_MINUTES", 0)),
            alert_queue: env_usize("TURNSTILE_ALERT_QUEUE", 64).max(1),
            bus: match std::env::var("TURNSTILE_BUS").as_deref() {
                Ok("session") => BusKind::Session,
                _ => BusKind::System,
            },
            premises,
        })
    }
}

fn offset_from_minutes(minutes: i32) -> FixedOffset {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| {
            tracing::warn!(minutes, "UTC offset out of range; using UTC");
            Utc.fix()
        })
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bounded_f32(key: &str, default: f32, max: f32) -> f32 {
    bounded(key, env_f32(key, default), default, max)
}

/// `value` if it lies in `[0, max]`, otherwise `default`. NaN is out of range.
fn bounded(key: &str, value: f32, default: f32, max: f32) -> f32 {
    if (0.0..=max).contains(&value) {
        value
    } else {
        tracing::warn!(key, value, default, "setting out of range; using default");
        default
    }
}

fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premises_full() {
        let premises = Premises::parse(
            r#"
            [geofence]
            latitude = 12.9716
            longitude = 77.5946
            radius_m = 100.0

            [[supervisors]]
            name = "Night desk"
            contact = "night-desk@example.org"

            [[supervisors]]
            name = "Facilities"
            contact = "facilities@example.org"
            "#,
        )
        .unwrap();
        let fence = premises.geofence.unwrap();
        assert_eq!(fence.radius_m, 100.0);
        assert_eq!(premises.supervisors.len(), 2);
        assert_eq!(premises.supervisors[1].name, "Facilities");
    }

    #[test]
    fn test_premises_empty_file() {
        let premises = Premises::parse("").unwrap();
        assert!(premises.geofence.is_none());
        assert!(premises.supervisors.is_empty());
    }

    #[test]
    fn test_premises_rejects_incomplete_geofence() {
        assert!(Premises::parse("[geofence]\nlatitude = 1.0\n").is_err());
    }

    #[test]
    fn test_offset_from_minutes() {
        assert_eq!(offset_from_minutes(330).local_minus_utc(), 19_800);
        assert_eq!(offset_from_minutes(-300).local_minus_utc(), -18_000);
        // Beyond +/-24h falls back to UTC.
        assert_eq!(offset_from_minutes(100_000).local_minus_utc(), 0);
    }

    #[test]
    fn test_bounded_rejects_nan_and_out_of_range() {
        let key = "TURNSTILE_MATCH_THRESHOLD";
        assert_eq!(bounded(key, 0.8, 1.0, MAX_MATCH_THRESHOLD), 0.8);
        assert_eq!(bounded(key, 2.0, 1.0, MAX_MATCH_THRESHOLD), 2.0);
        assert_eq!(bounded(key, f32::NAN, 1.0, MAX_MATCH_THRESHOLD), 1.0);
        assert_eq!(bounded(key, -0.5, 1.0, MAX_MATCH_THRESHOLD), 1.0);
        assert_eq!(bounded(key, f32::INFINITY, 1.0, MAX_MATCH_THRESHOLD), 1.0);
        assert_eq!(bounded("TURNSTILE_MIN_LIVENESS_CONFIDENCE", 1.5, 0.7, 1.0), 0.7);
    }
}
