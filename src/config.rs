//! Runtime configuration.
//!
//! Built once at startup (from a YAML file or the environment), validated, and
//! handed to the [`Engine`](crate::Engine) behind an `Arc`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::amount::{Cents, Liters};
use crate::model::Machine;
use crate::signing::DEFAULT_TTL_MS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid MACHINES_JSON: {0}")]
    Machines(#[from] serde_json::Error),

    #[error("invalid value '{value}' for {var}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ISO currency code, stored uppercase.
    pub currency: String,
    pub dispense: DispenseConfig,
    pub recharge: RechargeConfig,
    pub links: LinkConfig,
    pub machines: MachineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispenseConfig {
    /// Size of one full container in whole liters.
    pub container_liters: u32,
    pub price_per_container_cents: Cents,
    /// Overrides the price derived from the container price.
    pub price_per_liter_cents: Option<Cents>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RechargeConfig {
    pub min_cents: Cents,
    pub max_cents: Cents,
    pub sweep_page_size: usize,
    pub sweep_max_page_size: usize,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub secret: String,
    pub ttl_ms: i64,
    /// Front-end origin that signed links resolve to.
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Resolve ids missing from the registry as active, location-less machines.
    pub allow_unknown: bool,
    pub registry: Vec<Machine>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            currency: "MXN".to_string(),
            dispense: DispenseConfig::default(),
            recharge: RechargeConfig::default(),
            links: LinkConfig::default(),
            machines: MachineConfig::default(),
        }
    }
}

impl Default for DispenseConfig {
    fn default() -> Self {
        Self {
            container_liters: 20,
            price_per_container_cents: Cents::new(3500),
            price_per_liter_cents: None,
        }
    }
}

impl Default for RechargeConfig {
    fn default() -> Self {
        Self {
            min_cents: Cents::new(10 * 100),
            max_cents: Cents::new(500 * 100),
            sweep_page_size: 50,
            sweep_max_page_size: 200,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_ms: DEFAULT_TTL_MS,
            base_url: "http://localhost:5173".to_string(),
        }
    }
}

impl fmt::Debug for LinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkConfig")
            .field("secret", &"<redacted>")
            .field("ttl_ms", &self.ttl_ms)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl DispenseConfig {
    /// Explicit per-liter price, or the container price spread over its
    /// volume rounded half-up to the cent.
    pub fn price_per_liter(&self) -> Cents {
        self.price_per_liter_cents.unwrap_or_else(|| {
            let liters = self.container_liters.max(1) as i64;
            let container = self.price_per_container_cents.get();
            Cents::new((container * 2 + liters) / (liters * 2))
        })
    }

    /// Quarter, half and full container, rounded to one decimal.
    pub fn allowed_liters(&self) -> Vec<Liters> {
        let mut allowed = vec![
            Liters::fraction_of(self.container_liters, 4),
            Liters::fraction_of(self.container_liters, 2),
            Liters::whole(self.container_liters),
        ];
        allowed.dedup();
        allowed
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `lookup`, starting from the defaults. Unset or
    /// empty variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(currency) = get("CURRENCY") {
            config.currency = currency;
        }
        if let Some(liters) = parse_var(&get, "CONTAINER_LITERS")? {
            config.dispense.container_liters = liters;
        }
        if let Some(price) = parse_var(&get, "PRICE_PER_CONTAINER_CENTS")? {
            config.dispense.price_per_container_cents = Cents::new(price);
        }
        if let Some(price) = parse_var(&get, "PRICE_PER_LITER_CENTS")? {
            config.dispense.price_per_liter_cents = Some(Cents::new(price));
        }
        if let Some(min) = parse_var(&get, "RECHARGE_MIN_CENTS")? {
            config.recharge.min_cents = Cents::new(min);
        }
        if let Some(max) = parse_var(&get, "RECHARGE_MAX_CENTS")? {
            config.recharge.max_cents = Cents::new(max);
        }
        if let Some(secret) = get("QR_SIGNING_SECRET") {
            config.links.secret = secret;
        }
        if let Some(ttl) = parse_var(&get, "LINK_TTL_MS")? {
            config.links.ttl_ms = ttl;
        }
        if let Some(base_url) = get("QR_BASE_URL") {
            config.links.base_url = base_url;
        }
        if let Some(allow) = get("ALLOW_UNKNOWN_MACHINES") {
            config.machines.allow_unknown = allow.trim().eq_ignore_ascii_case("true");
        }
        if let Some(machines) = get("MACHINES_JSON") {
            config.machines.registry = serde_json::from_str(&machines)?;
        }

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.currency = self.currency.trim().to_ascii_uppercase();
        self.links.base_url = self.links.base_url.trim_end_matches('/').to_string();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.currency.is_empty() {
            return invalid("currency must not be empty".into());
        }
        if self.dispense.container_liters == 0 {
            return invalid("container_liters must be positive".into());
        }
        if !self.dispense.price_per_container_cents.is_positive() {
            return invalid("price per container must be positive".into());
        }
        let price_per_liter = self.dispense.price_per_liter();
        if !price_per_liter.is_positive() {
            return invalid("price per liter must be positive".into());
        }
        if let Some(smallest) = self.dispense.allowed_liters().into_iter().min() {
            if !smallest.price(price_per_liter).is_positive() {
                return invalid(format!("{smallest}L would be dispensed for free"));
            }
        }
        if !self.recharge.min_cents.is_positive() {
            return invalid("recharge minimum must be positive".into());
        }
        if self.recharge.min_cents > self.recharge.max_cents {
            return invalid(format!(
                "recharge minimum {} exceeds maximum {}",
                self.recharge.min_cents, self.recharge.max_cents
            ));
        }
        if self.recharge.sweep_page_size == 0
            || self.recharge.sweep_page_size > self.recharge.sweep_max_page_size
        {
            return invalid("sweep page size must be within 1..=sweep_max_page_size".into());
        }
        if self.links.secret.is_empty() {
            return invalid("link signing secret must be set".into());
        }
        if self.links.ttl_ms <= 0 {
            return invalid("link ttl must be positive".into());
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_with_secret() {
        let config = Config::from_lookup(lookup(&[("QR_SIGNING_SECRET", "s3cret")])).unwrap();
        assert_eq!(config.currency, "MXN");
        assert_eq!(config.dispense.price_per_liter(), Cents::new(175));
        assert_eq!(
            config.dispense.allowed_liters(),
            vec![Liters::whole(5), Liters::whole(10), Liters::whole(20)]
        );
        assert_eq!(config.recharge.min_cents, Cents::new(1000));
        assert_eq!(config.recharge.max_cents, Cents::new(50_000));
        assert_eq!(config.links.ttl_ms, 600_000);
    }

    #[test]
    fn missing_secret_is_rejected() {
        let result = Config::from_lookup(lookup(&[]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("QR_SIGNING_SECRET", "s3cret"),
            ("CURRENCY", "usd"),
            ("CONTAINER_LITERS", "19"),
            ("PRICE_PER_LITER_CENTS", "200"),
            ("ALLOW_UNKNOWN_MACHINES", "TRUE"),
            ("QR_BASE_URL", "https://aqua.example.com/"),
            (
                "MACHINES_JSON",
                r#"[{"id":"AQ-001","location":"Lobby"},{"id":"AQ-002","is_active":false}]"#,
            ),
        ]))
        .unwrap();
        assert_eq!(config.currency, "USD");
        assert_eq!(config.dispense.price_per_liter(), Cents::new(200));
        assert_eq!(
            config.dispense.allowed_liters(),
            vec![
                Liters::from_deciliters(48),
                Liters::from_deciliters(95),
                Liters::whole(19)
            ]
        );
        assert!(config.machines.allow_unknown);
        assert_eq!(config.links.base_url, "https://aqua.example.com");
        assert_eq!(config.machines.registry.len(), 2);
        assert_eq!(config.machines.registry[0].status, "ONLINE");
        assert!(config.machines.registry[0].is_active);
        assert!(!config.machines.registry[1].is_active);
    }

    #[test]
    fn malformed_number_is_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("QR_SIGNING_SECRET", "s3cret"),
            ("CONTAINER_LITERS", "twenty"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::Env {
                var: "CONTAINER_LITERS",
                ..
            })
        ));
    }

    #[test]
    fn malformed_machines_json_is_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("QR_SIGNING_SECRET", "s3cret"),
            ("MACHINES_JSON", r#"[{"id":"bad id"}]"#),
        ]));
        assert!(matches!(result, Err(ConfigError::Machines(_))));
    }

    #[test]
    fn inverted_recharge_bounds_are_rejected() {
        let result = Config::from_lookup(lookup(&[
            ("QR_SIGNING_SECRET", "s3cret"),
            ("RECHARGE_MIN_CENTS", "5000"),
            ("RECHARGE_MAX_CENTS", "1000"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn free_quantities_are_rejected() {
        // 1L container at 1 cent: the 0.3L quarter would cost 0.
        let result = Config::from_lookup(lookup(&[
            ("QR_SIGNING_SECRET", "s3cret"),
            ("CONTAINER_LITERS", "1"),
            ("PRICE_PER_CONTAINER_CENTS", "1"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("0.3L")));
    }

    #[test]
    fn container_price_is_checked_with_liter_override() {
        let result = Config::from_lookup(lookup(&[
            ("QR_SIGNING_SECRET", "s3cret"),
            ("PRICE_PER_CONTAINER_CENTS", "0"),
            ("PRICE_PER_LITER_CENTS", "200"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn sweep_page_bounds_are_checked() {
        let mut config = Config::from_lookup(lookup(&[("QR_SIGNING_SECRET", "s3cret")])).unwrap();
        config.recharge.sweep_max_page_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
currency: mxn
dispense:
  container_liters: 20
  price_per_container_cents: 4000
recharge:
  min_cents: 500
links:
  secret: from-file
  ttl_ms: 60000
machines:
  registry:
    - id: AQ-001
      location: Plaza
"#,
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.currency, "MXN");
        assert_eq!(config.dispense.price_per_liter(), Cents::new(200));
        assert_eq!(config.recharge.min_cents, Cents::new(500));
        assert_eq!(config.recharge.max_cents, Cents::new(50_000));
        assert_eq!(config.links.ttl_ms, 60_000);
        assert_eq!(config.machines.registry[0].location.as_deref(), Some("Plaza"));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = Config::from_lookup(lookup(&[("QR_SIGNING_SECRET", "s3cret")])).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }
}
