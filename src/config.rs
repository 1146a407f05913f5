//! Runtime configuration, read from `TURFBOOK_*` environment variables.
//!
//! Every variable is optional except the gateway secret, and the key id when the
//! hosted gateway is selected. Malformed values are errors rather than silently
//! replaced by defaults.

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use crate::calendar::{OperatingWindow, PriceTable, SlotCalendar};
use crate::model::{MINUTE_MS, Minor};
use crate::policy::CancellationPolicy;

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { var: &'static str, value: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "missing required environment variable {var}"),
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid value {value:?} for {var}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which payment gateway the server talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    /// In-process orders; for local runs.
    Sandbox,
    Razorpay,
}

impl std::str::FromStr for GatewayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sandbox" => Ok(GatewayKind::Sandbox),
            "razorpay" => Ok(GatewayKind::Razorpay),
            other => Err(format!("unknown gateway {other:?}, expected sandbox or razorpay")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub metrics_port: Option<u16>,
    pub data_dir: PathBuf,
    pub gateway: GatewayKind,
    pub gateway_key_id: Option<String>,
    pub gateway_secret: String,
    pub gateway_url: String,
    pub gateway_timeout: Duration,
    pub currency: String,
    pub timezone: Tz,
    pub open_hour: u32,
    pub close_hour: u32,
    pub day_price_minor: Minor,
    pub night_price_minor: Minor,
    pub night_start_hour: u32,
    pub night_end_hour: u32,
    pub cancel_cutoff_minutes: i64,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. `lookup` receives full names
    /// such as `TURFBOOK_PORT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };
        let config = Config {
            bind: env.string("TURFBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: env.parse("TURFBOOK_PORT")?.unwrap_or(8080),
            metrics_port: env.parse("TURFBOOK_METRICS_PORT")?,
            data_dir: env
                .string("TURFBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            gateway: env.parse("TURFBOOK_GATEWAY")?.unwrap_or(GatewayKind::Sandbox),
            gateway_key_id: env.string("TURFBOOK_GATEWAY_KEY_ID").filter(|s| !s.is_empty()),
            gateway_secret: env
                .string("TURFBOOK_GATEWAY_SECRET")
                .filter(|s| !s.is_empty())
                .ok_or(ConfigError::Missing("TURFBOOK_GATEWAY_SECRET"))?,
            gateway_url: env
                .string("TURFBOOK_GATEWAY_URL")
                .unwrap_or_else(|| crate::payment::DEFAULT_BASE_URL.into()),
            gateway_timeout: Duration::from_millis(
                env.parse("TURFBOOK_GATEWAY_TIMEOUT_MS")?.unwrap_or(10_000),
            ),
            currency: env.string("TURFBOOK_CURRENCY").unwrap_or_else(|| "INR".into()),
            timezone: env.parse("TURFBOOK_TIMEZONE")?.unwrap_or(chrono_tz::Asia::Kolkata),
            open_hour: env.parse("TURFBOOK_OPEN_HOUR")?.unwrap_or(7),
            close_hour: env.parse("TURFBOOK_CLOSE_HOUR")?.unwrap_or(2),
            day_price_minor: env.parse("TURFBOOK_DAY_PRICE")?.unwrap_or(1500),
            night_price_minor: env.parse("TURFBOOK_NIGHT_PRICE")?.unwrap_or(1600),
            night_start_hour: env.parse("TURFBOOK_NIGHT_START_HOUR")?.unwrap_or(23),
            night_end_hour: env.parse("TURFBOOK_NIGHT_END_HOUR")?.unwrap_or(2),
            cancel_cutoff_minutes: env.parse("TURFBOOK_CANCEL_CUTOFF_MINUTES")?.unwrap_or(120),
            compact_threshold: env.parse("TURFBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            lock_timeout: Duration::from_millis(
                env.parse("TURFBOOK_LOCK_TIMEOUT_MS")?.unwrap_or(2000),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway == GatewayKind::Razorpay && self.gateway_key_id.is_none() {
            return Err(ConfigError::Missing("TURFBOOK_GATEWAY_KEY_ID"));
        }
        for (var, hour) in [
            ("TURFBOOK_OPEN_HOUR", self.open_hour),
            ("TURFBOOK_CLOSE_HOUR", self.close_hour),
            ("TURFBOOK_NIGHT_START_HOUR", self.night_start_hour),
            ("TURFBOOK_NIGHT_END_HOUR", self.night_end_hour),
        ] {
            if hour > 23 {
                return Err(invalid(var, hour, "hour must be within 0..=23"));
            }
        }
        for (var, price) in [
            ("TURFBOOK_DAY_PRICE", self.day_price_minor),
            ("TURFBOOK_NIGHT_PRICE", self.night_price_minor),
        ] {
            if price <= 0 {
                return Err(invalid(var, price, "price must be positive"));
            }
        }
        if self.cancel_cutoff_minutes < 0 {
            return Err(invalid(
                "TURFBOOK_CANCEL_CUTOFF_MINUTES",
                self.cancel_cutoff_minutes,
                "must not be negative",
            ));
        }
        Ok(())
    }

    pub fn calendar(&self) -> Result<SlotCalendar, ConfigError> {
        let window = OperatingWindow::new(self.open_hour, self.close_hour).map_err(|e| {
            invalid("TURFBOOK_OPEN_HOUR", self.open_hour, &e.to_string())
        })?;
        let prices = PriceTable::day_night(
            self.day_price_minor,
            self.night_price_minor,
            self.night_start_hour,
            self.night_end_hour,
        );
        Ok(SlotCalendar::new(self.timezone, window, prices))
    }

    pub fn cancellation_policy(&self) -> CancellationPolicy {
        CancellationPolicy::new(self.cancel_cutoff_minutes * MINUTE_MS)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("turfbook.wal")
    }
}

fn invalid(var: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid { var, value: value.to_string(), reason: reason.to_string() }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
        }
    }
}
