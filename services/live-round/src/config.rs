//! Service configuration.
//!
//! The YAML file is optional; every field has a default. A handful of
//! timing and network fields can be overridden with `LIVE_ROUND_*`
//! environment variables, which win over the file.

use aviator_execution::{
    CrashCurve, CrashError, EngineConfig, MultiplierCurve, PaymentLimits, PhaseConfig, RoundSeed,
    StakeLimits, DEFAULT_RETRY_ATTEMPTS, SEED_LEN,
};
use aviator_types::{
    Amount, DEFAULT_BETTING_MS, DEFAULT_COOLDOWN_MS, DEFAULT_MAX_PANELS, DEFAULT_MAX_STAKE,
    DEFAULT_TICK_MS, MAX_DEPOSIT, MIN_DEPOSIT, MIN_STAKE, MIN_WITHDRAWAL, REFERRAL_BONUS_BPS,
    ROUND_HISTORY_LEN,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::Level;
use url::Url;

/// How approved withdrawals reach the player.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalMode {
    /// Requests wait for an admin to approve or reject them.
    #[default]
    Manual,
    /// Requests are paid out through the gateway immediately.
    Gateway,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Unset means the sandbox gateway.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Where the vendor should post results.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite file. Unset runs on the in-memory ledger.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_betting_ms")]
    pub betting_ms: u64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_min_stake")]
    pub min_stake: Amount,
    #[serde(default = "default_max_stake")]
    pub max_stake: Amount,
    #[serde(default = "default_max_panels")]
    pub max_panels: u8,
    #[serde(default = "default_multiplier_curve")]
    pub multiplier: MultiplierCurve,
    #[serde(default)]
    pub crash_curve: CrashCurve,
    /// Hex master secret. Unset draws one from the OS at startup.
    #[serde(default)]
    pub master_seed: Option<String>,

    #[serde(default = "default_min_deposit")]
    pub min_deposit: Amount,
    #[serde(default = "default_max_deposit")]
    pub max_deposit: Amount,
    #[serde(default = "default_min_withdrawal")]
    pub min_withdrawal: Amount,
    #[serde(default = "default_referral_bonus_bps")]
    pub referral_bonus_bps: u64,
    #[serde(default)]
    pub withdrawal_mode: WithdrawalMode,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Required in the `x-admin-token` header on admin routes when set.
    #[serde(default)]
    pub admin_token: Option<String>,

    #[serde(default = "default_ledger_retry_attempts")]
    pub ledger_retry_attempts: u32,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9124
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_betting_ms() -> u64 {
    DEFAULT_BETTING_MS
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_min_stake() -> Amount {
    MIN_STAKE
}

fn default_max_stake() -> Amount {
    DEFAULT_MAX_STAKE
}

fn default_max_panels() -> u8 {
    DEFAULT_MAX_PANELS
}

fn default_multiplier_curve() -> MultiplierCurve {
    MultiplierCurve::default()
}

fn default_min_deposit() -> Amount {
    MIN_DEPOSIT
}

fn default_max_deposit() -> Amount {
    MAX_DEPOSIT
}

fn default_min_withdrawal() -> Amount {
    MIN_WITHDRAWAL
}

fn default_referral_bonus_bps() -> u64 {
    REFERRAL_BONUS_BPS
}

fn default_ledger_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_history_len() -> usize {
    ROUND_HISTORY_LEN
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            callback_url: None,
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: None,
            log_level: default_log_level(),
            betting_ms: default_betting_ms(),
            tick_ms: default_tick_ms(),
            cooldown_ms: default_cooldown_ms(),
            min_stake: default_min_stake(),
            max_stake: default_max_stake(),
            max_panels: default_max_panels(),
            multiplier: default_multiplier_curve(),
            crash_curve: CrashCurve::default(),
            master_seed: None,
            min_deposit: default_min_deposit(),
            max_deposit: default_max_deposit(),
            min_withdrawal: default_min_withdrawal(),
            referral_bonus_bps: default_referral_bonus_bps(),
            withdrawal_mode: WithdrawalMode::default(),
            gateway: GatewayConfig::default(),
            admin_token: None,
            ledger_retry_attempts: default_ledger_retry_attempts(),
            history_len: default_history_len(),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{field} must be > 0")]
    InvalidNonZero { field: &'static str },
    #[error("{field} is invalid: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{min_field} ({min}) must not exceed {max_field} ({max})")]
    InvalidRange {
        min_field: &'static str,
        min: u64,
        max_field: &'static str,
        max: u64,
    },
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be http or https: {value}")]
    InvalidUrlScheme { field: &'static str, value: String },
    #[error("invalid crash curve: {0}")]
    CrashCurve(#[from] CrashError),
}

#[derive(Clone, Debug)]
pub struct ValidatedGateway {
    pub base_url: Option<Url>,
    pub api_key: Option<String>,
    pub callback_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub listen: SocketAddr,
    pub database: Option<PathBuf>,
    pub log_level: Level,
    pub engine: EngineConfig,
    pub crash_curve: CrashCurve,
    pub master_seed: Option<RoundSeed>,
    pub payments: PaymentLimits,
    pub min_withdrawal: Amount,
    pub withdrawal_mode: WithdrawalMode,
    pub gateway: ValidatedGateway,
    pub admin_token: Option<String>,
    pub ledger_retry_attempts: u32,
}

impl ValidatedConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.engine.phases.tick_ms)
    }
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `LIVE_ROUND_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = lookup("LIVE_ROUND_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse(&lookup, "LIVE_ROUND_PORT")? {
            self.port = port;
        }
        if let Some(ms) = env_parse(&lookup, "LIVE_ROUND_BETTING_MS")? {
            self.betting_ms = ms;
        }
        if let Some(ms) = env_parse(&lookup, "LIVE_ROUND_TICK_MS")? {
            self.tick_ms = ms;
        }
        if let Some(ms) = env_parse(&lookup, "LIVE_ROUND_COOLDOWN_MS")? {
            self.cooldown_ms = ms;
        }
        if let Some(path) = lookup("LIVE_ROUND_DB") {
            self.database = (!path.trim().is_empty()).then_some(path);
        }
        Ok(())
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        ensure_nonzero("betting_ms", self.betting_ms)?;
        ensure_nonzero("tick_ms", self.tick_ms)?;
        ensure_nonzero("cooldown_ms", self.cooldown_ms)?;
        ensure_nonzero("min_stake", self.min_stake)?;
        ensure_range("min_stake", self.min_stake, "max_stake", self.max_stake)?;
        ensure_nonzero("max_panels", u64::from(self.max_panels))?;
        ensure_nonzero("min_deposit", self.min_deposit)?;
        ensure_range("min_deposit", self.min_deposit, "max_deposit", self.max_deposit)?;
        ensure_nonzero("min_withdrawal", self.min_withdrawal)?;
        ensure_nonzero("ledger_retry_attempts", u64::from(self.ledger_retry_attempts))?;
        ensure_nonzero("history_len", self.history_len as u64)?;
        ensure_nonzero("gateway.timeout_ms", self.gateway.timeout_ms)?;
        self.crash_curve.validate()?;

        let log_level = Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
            value: self.log_level.clone(),
        })?;
        let listen = format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidValue {
                field: "host",
                value: self.host.clone(),
            })?;
        let master_seed = self
            .master_seed
            .as_deref()
            .map(|raw| {
                parse_seed(raw).ok_or_else(|| ConfigError::InvalidValue {
                    field: "master_seed",
                    value: "<redacted>".to_string(),
                })
            })
            .transpose()?;
        let base_url = self
            .gateway
            .base_url
            .as_deref()
            .map(|raw| validate_http_url("gateway.base_url", raw))
            .transpose()?;
        let callback_url = self
            .gateway
            .callback_url
            .as_deref()
            .map(|raw| validate_http_url("gateway.callback_url", raw))
            .transpose()?;
        if self.withdrawal_mode == WithdrawalMode::Gateway && base_url.is_none() {
            tracing::warn!("gateway withdrawals configured without a gateway URL; payouts go to the sandbox");
        }

        let engine = EngineConfig {
            phases: PhaseConfig::new(self.betting_ms, self.tick_ms, self.cooldown_ms),
            curve: self.multiplier,
            limits: StakeLimits {
                min_stake: self.min_stake,
                max_stake: self.max_stake,
                max_panels: self.max_panels,
            },
            history_len: self.history_len,
        };
        engine.validate().map_err(|reason| ConfigError::InvalidValue {
            field: "engine",
            value: reason.to_string(),
        })?;

        Ok(ValidatedConfig {
            listen,
            database: self.database.map(PathBuf::from),
            log_level,
            engine,
            crash_curve: self.crash_curve,
            master_seed,
            payments: PaymentLimits {
                min_deposit: self.min_deposit,
                max_deposit: self.max_deposit,
                referral_bonus_bps: self.referral_bonus_bps,
            },
            min_withdrawal: self.min_withdrawal,
            withdrawal_mode: self.withdrawal_mode,
            gateway: ValidatedGateway {
                base_url,
                api_key: self.gateway.api_key,
                callback_url,
                timeout: Duration::from_millis(self.gateway.timeout_ms),
            },
            admin_token: self.admin_token.filter(|token| !token.is_empty()),
            ledger_retry_attempts: self.ledger_retry_attempts,
        })
    }
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { field: key, value: raw }),
    }
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field });
    }
    Ok(())
}

fn ensure_range(min_field: &'static str, min: u64, max_field: &'static str, max: u64) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::InvalidRange {
            min_field,
            min,
            max_field,
            max,
        });
    }
    Ok(())
}

fn validate_http_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ConfigError::InvalidUrlScheme {
                field,
                value: value.to_string(),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        });
    }
    Ok(url)
}

/// Decode a 64-character hex master secret.
fn parse_seed(raw: &str) -> Option<RoundSeed> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    if raw.len() != SEED_LEN * 2 {
        return None;
    }
    let mut seed = [0u8; SEED_LEN];
    for (byte, chunk) in seed.iter_mut().zip(raw.as_bytes().chunks(2)) {
        let pair = std::str::from_utf8(chunk).ok()?;
        *byte = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aviator_types::Multiplier;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config, Config::default());
        let validated = config.validate().unwrap();
        assert_eq!(validated.engine.phases.betting_ms, 5_000);
        assert_eq!(validated.engine.phases.tick_ms, 100);
        assert_eq!(validated.engine.limits.min_stake, 10);
        assert_eq!(validated.payments.max_deposit, 150_000);
        assert_eq!(validated.min_withdrawal, 100);
        assert_eq!(validated.withdrawal_mode, WithdrawalMode::Manual);
        assert!(validated.database.is_none());
        assert!(validated.gateway.base_url.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let config = Config::from_yaml(
            "port: 8080\nmax_stake: 5000\nwithdrawal_mode: gateway\ncrash_curve:\n  kind: hazard\n  base_ppm: 20000\n  slope_ppm: 10000\n  max: 5000\ngateway:\n  base_url: https://pay.example.com/api\n",
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.betting_ms, DEFAULT_BETTING_MS);
        assert_eq!(config.gateway.timeout_ms, 10_000);
        let validated = config.validate().unwrap();
        assert_eq!(validated.engine.limits.max_stake, 5_000);
        assert_eq!(validated.withdrawal_mode, WithdrawalMode::Gateway);
        assert_eq!(validated.crash_curve.max(), Multiplier::from_hundredths(5_000));
        assert_eq!(
            validated.gateway.base_url.map(|u| u.to_string()),
            Some("https://pay.example.com/api".to_string())
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_yaml("port: 8080\nbetting_ms: 7000\n").unwrap();
        config
            .apply_env_with(env(&[
                ("LIVE_ROUND_HOST", "127.0.0.1"),
                ("LIVE_ROUND_PORT", "9000"),
                ("LIVE_ROUND_TICK_MS", "50"),
                ("LIVE_ROUND_DB", "/var/lib/aviator/ledger.db"),
            ]))
            .unwrap();
        let validated = config.validate().unwrap();
        assert_eq!(validated.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(validated.engine.phases.betting_ms, 7_000);
        assert_eq!(validated.engine.phases.tick_ms, 50);
        assert_eq!(
            validated.database,
            Some(PathBuf::from("/var/lib/aviator/ledger.db"))
        );
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(env(&[("LIVE_ROUND_COOLDOWN_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "LIVE_ROUND_COOLDOWN_MS",
                ..
            }
        ));
    }

    type Case = (Box<dyn Fn(&mut Config)>, &'static str);

    fn case(mutate: impl Fn(&mut Config) + 'static, expected: &'static str) -> Case {
        (Box::new(mutate), expected)
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases: Vec<Case> = vec![
            case(|c| c.tick_ms = 0, "tick_ms must be > 0"),
            case(|c| c.betting_ms = 0, "betting_ms must be > 0"),
            case(|c| c.cooldown_ms = 0, "cooldown_ms must be > 0"),
            case(|c| c.min_stake = 0, "min_stake must be > 0"),
            case(|c| c.max_panels = 0, "max_panels must be > 0"),
            case(
                |c| {
                    c.min_stake = 500;
                    c.max_stake = 100;
                },
                "min_stake (500) must not exceed max_stake (100)",
            ),
            case(
                |c| {
                    c.crash_curve = CrashCurve::HouseEdge {
                        edge_bps: 10_000,
                        max: Multiplier::from_hundredths(1_000),
                    }
                },
                "invalid crash curve",
            ),
            case(
                |c| {
                    c.crash_curve = CrashCurve::HouseEdge {
                        edge_bps: 100,
                        max: Multiplier::from_hundredths(99),
                    }
                },
                "invalid crash curve",
            ),
            case(|c| c.log_level = "loud".to_string(), "invalid log level"),
            case(
                |c| c.gateway.base_url = Some("ftp://pay.example.com".to_string()),
                "URL scheme must be http or https",
            ),
            case(|c| c.master_seed = Some("abcd".to_string()), "master_seed is invalid"),
        ];
        for (mutate, expected) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains(expected), "{err:?} does not mention {expected:?}");
        }
    }

    #[test]
    fn test_master_seed_hex() {
        let hex = "2a".repeat(32);
        let config = Config {
            master_seed: Some(format!("0x{hex}")),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap().master_seed, Some([42u8; 32]));
    }
}
