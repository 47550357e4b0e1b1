//! YAML configuration model.
//!
//! Alert settings use option semantics throughout: a field left unset in a
//! chain's `alerts` block inherits the value from `default_alert_config`,
//! while an explicitly-set value (including zero) overrides it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::error::MonitorError;

/// Alert severity, ordered so that sink thresholds can filter with a simple
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Info,
	Warning,
	Critical,
}

impl FromStr for Severity {
	type Err = MonitorError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"info" => Ok(Severity::Info),
			"warning" => Ok(Severity::Warning),
			"critical" => Ok(Severity::Critical),
			other => Err(MonitorError::Config(format!("unknown severity {other:?}"))),
		}
	}
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Severity::Info => "info",
			Severity::Warning => "warning",
			Severity::Critical => "critical",
		};
		f.write_str(s)
	}
}

/// Top-level configuration, loaded from `config.yml` plus an optional
/// directory of per-chain files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub enable_dashboard: bool,
	/// Dashboard listen URL, e.g. `http://0.0.0.0:8888`.
	#[serde(rename = "listen_port")]
	pub listen: String,
	/// Suppress the dashboard log stream (and alarm detail) for public
	/// dashboards.
	pub hide_logs: bool,

	/// Minutes an endpoint (or the whole fleet) must be unreachable before a
	/// node-down style alert fires.
	pub node_down_alert_minutes: i64,
	pub node_down_alert_severity: Option<Severity>,

	pub tls_skip_verify: bool,

	#[serde(rename = "prometheus_enabled")]
	pub prometheus: bool,
	pub prometheus_listen_port: u16,

	pub coin_market_cap_api_token: String,
	#[serde(rename = "convert_to_fiat")]
	pub price_conversion: PriceConversionConfig,

	pub healthcheck: HealthcheckConfig,

	/// Hours between repeat notifications for still-unvoted governance
	/// proposals. Values below 1 fall back to 6.
	pub governance_alerts_reminder_interval: i64,

	pub default_alert_config: AlertConfig,
	pub chains: BTreeMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConversionConfig {
	pub enabled: bool,
	pub currency: String,
	/// Cache lifetime in hours.
	pub cache_expiration: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
	pub enabled: bool,
	pub ping_url: String,
	#[serde(with = "humantime_serde")]
	pub ping_rate: Duration,
}

impl Default for HealthcheckConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			ping_url: String::new(),
			ping_rate: Duration::from_secs(300),
		}
	}
}

/// Which chain-data provider implementation to use and its free-form
/// settings. The shape of `configs` is validated when the provider is
/// constructed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
	pub name: String,
	pub configs: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
	pub url: String,
	pub alert_if_down: bool,
}

/// One monitored validator. The map key in `chains` (or the file stem in the
/// chain-config directory) becomes the display label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
	/// Authoritative chain id; every endpoint must report it.
	pub chain_id: String,
	/// Operator address of the validator to watch.
	pub valoper_address: String,
	/// Skip the consensus-key lookup and use this bech32 address directly.
	pub valcons_override: String,
	pub public_fallback: bool,
	/// CoinMarketCap slug for fiat conversion.
	pub slug: String,
	/// Overrides the queried inflation rate when non-zero.
	#[serde(rename = "inflationRate")]
	pub inflation_rate: f64,
	pub provider: ProviderConfig,
	pub nodes: Vec<NodeConfig>,
	pub alerts: AlertConfig,
}

/// Per-chain alert tuning. Every field is optional so unset values inherit
/// the process-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
	pub stalled_minutes: Option<i64>,
	pub stalled_enabled: Option<bool>,

	pub consecutive_missed: Option<i64>,
	pub consecutive_priority: Option<Severity>,
	pub consecutive_enabled: Option<bool>,

	pub percentage_missed: Option<i64>,
	pub percentage_priority: Option<Severity>,
	pub percentage_enabled: Option<bool>,

	pub consecutive_empty: Option<i64>,
	pub consecutive_empty_priority: Option<Severity>,
	pub consecutive_empty_enabled: Option<bool>,

	pub empty_percentage: Option<i64>,
	pub empty_percentage_priority: Option<Severity>,
	pub empty_percentage_enabled: Option<bool>,

	pub alert_if_inactive: Option<bool>,
	pub alert_if_no_servers: Option<bool>,

	pub governance_alerts: Option<bool>,

	pub stake_change_alerts: Option<bool>,
	pub stake_change_drop_threshold: Option<f64>,
	pub stake_change_increase_threshold: Option<f64>,

	pub unclaimed_rewards_alerts: Option<bool>,
	pub unclaimed_rewards_threshold_in_fiat_currency: Option<f64>,

	pub pagerduty: PagerdutyConfig,
	pub discord: DiscordConfig,
	pub telegram: TelegramConfig,
	pub slack: SlackConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerdutyConfig {
	pub enabled: Option<bool>,
	pub api_key: Option<String>,
	pub default_severity: Option<Severity>,
	pub severity_threshold: Option<Severity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
	pub enabled: Option<bool>,
	pub webhook: Option<String>,
	pub mentions: Option<Vec<String>>,
	pub severity_threshold: Option<Severity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
	pub enabled: Option<bool>,
	pub api_key: Option<String>,
	pub channel: Option<String>,
	pub mentions: Option<Vec<String>>,
	pub severity_threshold: Option<Severity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
	pub enabled: Option<bool>,
	pub webhook: Option<String>,
	pub mentions: Option<Vec<String>>,
	pub severity_threshold: Option<Severity>,
}

macro_rules! inherit_fields {
	($dst:ident, $src:ident, $($field:ident),+ $(,)?) => {
		$(
			if $dst.$field.is_none() {
				$dst.$field = $src.$field.clone();
			}
		)+
	};
}

impl AlertConfig {
	/// Fills every unset field from `defaults`. Explicitly-set values,
	/// including zeros and `false`, are kept.
	pub fn inherit(&mut self, defaults: &AlertConfig) {
		inherit_fields!(
			self,
			defaults,
			stalled_minutes,
			stalled_enabled,
			consecutive_missed,
			consecutive_priority,
			consecutive_enabled,
			percentage_missed,
			percentage_priority,
			percentage_enabled,
			consecutive_empty,
			consecutive_empty_priority,
			consecutive_empty_enabled,
			empty_percentage,
			empty_percentage_priority,
			empty_percentage_enabled,
			alert_if_inactive,
			alert_if_no_servers,
			governance_alerts,
			stake_change_alerts,
			stake_change_drop_threshold,
			stake_change_increase_threshold,
			unclaimed_rewards_alerts,
			unclaimed_rewards_threshold_in_fiat_currency,
		);
		{
			let dst = &mut self.pagerduty;
			let src = &defaults.pagerduty;
			inherit_fields!(dst, src, enabled, api_key, default_severity, severity_threshold);
		}
		{
			let dst = &mut self.discord;
			let src = &defaults.discord;
			inherit_fields!(dst, src, enabled, webhook, mentions, severity_threshold);
		}
		{
			let dst = &mut self.telegram;
			let src = &defaults.telegram;
			inherit_fields!(dst, src, enabled, api_key, channel, mentions, severity_threshold);
		}
		{
			let dst = &mut self.slack;
			let src = &defaults.slack;
			inherit_fields!(dst, src, enabled, webhook, mentions, severity_threshold);
		}
	}
}

impl Config {
	/// Reads the main YAML file, merges per-chain files from `chain_dir` (file
	/// stem becomes the chain label), and applies alert defaults.
	pub fn load(path: &Path, chain_dir: Option<&Path>) -> Result<Self, MonitorError> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| MonitorError::Config(format!("cannot read {}: {e}", path.display())))?;
		let mut cfg: Config = serde_yaml::from_str(&raw)
			.map_err(|e| MonitorError::Config(format!("cannot parse {}: {e}", path.display())))?;

		if let Some(dir) = chain_dir {
			for entry in std::fs::read_dir(dir)
				.map_err(|e| MonitorError::Config(format!("cannot scan {}: {e}", dir.display())))?
			{
				let entry = entry.map_err(|e| MonitorError::Config(e.to_string()))?;
				let p = entry.path();
				let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
				if ext != "yml" && ext != "yaml" {
					continue;
				}
				let Some(stem) = p.file_stem().and_then(|s| s.to_str()) else {
					continue;
				};
				let raw = std::fs::read_to_string(&p).map_err(|e| {
					MonitorError::Config(format!("cannot read {}: {e}", p.display()))
				})?;
				let chain: ChainConfig = serde_yaml::from_str(&raw).map_err(|e| {
					MonitorError::Config(format!("cannot parse {}: {e}", p.display()))
				})?;
				tracing::info!(file = %p.display(), chain = stem, "adding chain from config directory");
				cfg.chains.insert(stem.to_string(), chain);
			}
		}

		for chain in cfg.chains.values_mut() {
			chain.alerts.inherit(&cfg.default_alert_config);
		}
		Ok(cfg)
	}

	/// Non-exhaustive sanity check. Fatal problems prevent any monitoring;
	/// the rest are reported as warnings.
	pub fn validate(&mut self) -> (bool, Vec<String>) {
		let mut fatal = false;
		let mut problems = Vec::new();

		if self.chains.is_empty() {
			fatal = true;
			problems.push("error: no chains configured".to_string());
		}

		if self.enable_dashboard {
			match url::Url::parse(&self.listen) {
				Ok(u) if u.port_or_known_default().is_some() => {}
				_ => {
					fatal = true;
					problems.push(format!(
						"error: the listen URL {:?} does not appear to be valid",
						self.listen
					));
				}
			}
		}

		if self.default_alert_config.pagerduty.enabled.unwrap_or(false) {
			// V2 Events routing keys are 32 hex-ish chars; OAuth tokens carry
			// separators that routing keys never do.
			let oauth_like = Regex::new(r"[+_-]").expect("static regex");
			let key = self
				.default_alert_config
				.pagerduty
				.api_key
				.as_deref()
				.unwrap_or_default();
			if oauth_like.is_match(key) {
				fatal = true;
				problems.push(
					"error: the PagerDuty key appears to be an OAuth token, not a V2 Events API key"
						.to_string(),
				);
			}
		}

		if self.node_down_alert_minutes < 3 {
			problems.push(
				"warning: node_down_alert_minutes below three minutes may cause false alarms"
					.to_string(),
			);
		}

		if self.governance_alerts_reminder_interval <= 0 {
			self.governance_alerts_reminder_interval = 6;
		}

		for (name, chain) in &self.chains {
			if chain.chain_id.is_empty() {
				fatal = true;
				problems.push(format!("error: chain {name} has no chain_id"));
			}
			if chain.valoper_address.is_empty() && chain.valcons_override.is_empty() {
				fatal = true;
				problems.push(format!(
					"error: chain {name} has neither valoper_address nor valcons_override"
				));
			}
			if chain.nodes.is_empty() && !chain.public_fallback {
				problems.push(format!(
					"warning: chain {name} has no nodes and public_fallback is off"
				));
			}
		}

		(fatal, problems)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn yaml(s: &str) -> Config {
		serde_yaml::from_str(s).expect("test yaml")
	}

	#[test]
	fn severity_ordering_and_parse() {
		assert!(Severity::Info < Severity::Warning);
		assert!(Severity::Warning < Severity::Critical);
		assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
		assert!("nope".parse::<Severity>().is_err());
	}

	#[test]
	fn unset_fields_inherit_defaults() {
		let defaults = AlertConfig {
			stalled_minutes: Some(10),
			stalled_enabled: Some(true),
			consecutive_missed: Some(5),
			..Default::default()
		};
		let mut chain = AlertConfig {
			consecutive_missed: Some(2),
			..Default::default()
		};
		chain.inherit(&defaults);
		assert_eq!(chain.stalled_minutes, Some(10));
		assert_eq!(chain.stalled_enabled, Some(true));
		// explicitly set value wins
		assert_eq!(chain.consecutive_missed, Some(2));
	}

	#[test]
	fn explicit_zero_overrides_default() {
		let defaults = AlertConfig {
			percentage_missed: Some(10),
			..Default::default()
		};
		let mut chain: AlertConfig = serde_yaml::from_str("percentage_missed: 0").unwrap();
		chain.inherit(&defaults);
		assert_eq!(chain.percentage_missed, Some(0));
	}

	#[test]
	fn sink_settings_inherit_per_field() {
		let defaults = AlertConfig {
			pagerduty: PagerdutyConfig {
				enabled: Some(true),
				api_key: Some("abc123".into()),
				default_severity: None,
				severity_threshold: Some(Severity::Critical),
			},
			..Default::default()
		};
		let mut chain = AlertConfig {
			pagerduty: PagerdutyConfig {
				severity_threshold: Some(Severity::Info),
				..Default::default()
			},
			..Default::default()
		};
		chain.inherit(&defaults);
		assert_eq!(chain.pagerduty.api_key.as_deref(), Some("abc123"));
		assert_eq!(chain.pagerduty.severity_threshold, Some(Severity::Info));
	}

	#[test]
	fn validate_flags_missing_chains_as_fatal() {
		let mut cfg = yaml("{}");
		let (fatal, problems) = cfg.validate();
		assert!(fatal);
		assert!(problems.iter().any(|p| p.contains("no chains")));
	}

	#[test]
	fn validate_flags_bad_listen_url() {
		let mut cfg = yaml(
			r#"
enable_dashboard: true
listen_port: "not a url"
chains:
  test:
    chain_id: test-1
    valoper_address: cosmosvaloper1xxxx
"#,
		);
		let (fatal, problems) = cfg.validate();
		assert!(fatal);
		assert!(problems.iter().any(|p| p.contains("listen URL")));
	}

	#[test]
	fn validate_flags_oauth_shaped_pagerduty_key() {
		let mut cfg = yaml(
			r#"
node_down_alert_minutes: 5
default_alert_config:
  pagerduty:
    enabled: true
    api_key: "u+abcdef_ghij-klmno"
chains:
  test:
    chain_id: test-1
    valoper_address: cosmosvaloper1xxxx
"#,
		);
		let (fatal, problems) = cfg.validate();
		assert!(fatal);
		assert!(problems.iter().any(|p| p.contains("OAuth")));
	}

	#[test]
	fn reminder_interval_defaults_to_six() {
		let mut cfg = yaml(
			r#"
node_down_alert_minutes: 5
chains:
  test:
    chain_id: test-1
    valoper_address: cosmosvaloper1xxxx
"#,
		);
		cfg.validate();
		assert_eq!(cfg.governance_alerts_reminder_interval, 6);
	}

	#[test]
	fn chain_yaml_round_trip() {
		let chain: ChainConfig = serde_yaml::from_str(
			r#"
chain_id: osmosis-1
valoper_address: osmovaloper1abc
slug: osmosis
inflationRate: 0.08
provider:
  name: default
nodes:
  - url: http://127.0.0.1:26657
    alert_if_down: true
alerts:
  consecutive_missed: 3
  pagerduty:
    enabled: false
"#,
		)
		.unwrap();
		assert_eq!(chain.chain_id, "osmosis-1");
		assert_eq!(chain.inflation_rate, 0.08);
		assert_eq!(chain.nodes.len(), 1);
		assert_eq!(chain.alerts.consecutive_missed, Some(3));
		assert_eq!(chain.alerts.pagerduty.enabled, Some(false));
	}
}
