//! `tally.toml` parsing.
//!
//! Every section and field is optional; a missing file means all defaults.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing_subscriber::EnvFilter;

use crate::{
    abi::Bytes32,
    identity::{Identity, IdentityError},
    ledger::{LedgerSettings, DEFAULT_CALL_GAS_CAP},
    view::SlotSpec,
};

pub const DEFAULT_CONFIG_PATH: &str = "tally.toml";
pub const DEFAULT_GAS_LIMIT: u64 = 4_700_000;

/// Log filter for the binaries: `--log-level` when given, else `RUST_LOG`,
/// else `fallback`. A layer that does not parse is skipped.
pub fn log_filter(flag: Option<&str>, env: Option<&str>, fallback: &str) -> EnvFilter {
    flag.into_iter()
        .chain(env)
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Validation(String),
    #[error("deploy identity: {0}")]
    Identity(#[from] IdentityError),
}

/// `local` runs an in-process ledger; anything else is a node address.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Endpoint {
    #[default]
    Local,
    Rpc(String),
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ConfigError::Validation("empty ledger endpoint".into())),
            "local" => Ok(Endpoint::Local),
            addr => Ok(Endpoint::Rpc(addr.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local => f.write_str("local"),
            Endpoint::Rpc(addr) => f.write_str(addr),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TallyConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub view: ViewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Block interval of the in-process ledger.
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,
    /// How often pending transactions are polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_call_gas_cap")]
    pub call_gas_cap: u64,
    #[serde(default = "default_dev_seed")]
    pub dev_seed: u64,
    #[serde(default = "default_dev_accounts")]
    pub dev_accounts: u32,
}

fn default_block_interval_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_call_gas_cap() -> u64 {
    DEFAULT_CALL_GAS_CAP
}

fn default_dev_seed() -> u64 {
    8545
}

fn default_dev_accounts() -> u32 {
    10
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Local,
            block_interval_ms: default_block_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            call_gas_cap: default_call_gas_cap(),
            dev_seed: default_dev_seed(),
            dev_accounts: default_dev_accounts(),
        }
    }
}

impl LedgerConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settings(&self) -> LedgerSettings {
        LedgerSettings {
            dev_seed: self.dev_seed,
            dev_accounts: self.dev_accounts,
            call_gas_cap: self.call_gas_cap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    #[serde(default = "default_source")]
    pub source: PathBuf,
    #[serde(default = "default_candidates")]
    pub candidates: Vec<String>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Index into the development accounts. Ignored when `secret_hex` is set.
    #[serde(default)]
    pub account: u32,
    #[serde(default)]
    pub secret_hex: Option<String>,
    #[serde(default = "default_descriptor")]
    pub descriptor: PathBuf,
}

fn default_source() -> PathBuf {
    PathBuf::from("demos/Voting.tally")
}

fn default_candidates() -> Vec<String> {
    vec!["Rama".into(), "Nick".into(), "Claudius".into()]
}

fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

fn default_descriptor() -> PathBuf {
    PathBuf::from(crate::descriptor::DEFAULT_PATH)
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            candidates: default_candidates(),
            gas_limit: default_gas_limit(),
            account: 0,
            secret_hex: None,
            descriptor: default_descriptor(),
        }
    }
}

impl DeployConfig {
    pub fn candidate_ids(&self) -> Result<Vec<Bytes32>, ConfigError> {
        self.candidates
            .iter()
            .map(|name| {
                name.parse::<Bytes32>()
                    .map_err(|e| ConfigError::Validation(format!("candidate {name:?}: {e}")))
            })
            .collect()
    }

    pub fn identity(&self, dev_seed: u64) -> Result<Identity, ConfigError> {
        match &self.secret_hex {
            Some(secret) => Ok(Identity::from_secret_hex(secret)?),
            None => Ok(Identity::dev(dev_seed, self.account)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ViewConfig {
    /// Display slots; empty means one numbered slot per deploy candidate.
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
}

impl TallyConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.poll_interval_ms == 0 {
            return Err(ConfigError::Validation("ledger.poll_interval_ms must be positive".into()));
        }
        if self.ledger.block_interval_ms == 0 {
            return Err(ConfigError::Validation("ledger.block_interval_ms must be positive".into()));
        }
        if self.deploy.account >= self.ledger.dev_accounts && self.deploy.secret_hex.is_none() {
            return Err(ConfigError::Validation(format!(
                "deploy.account {} is outside the {} development accounts",
                self.deploy.account, self.ledger.dev_accounts
            )));
        }
        self.deploy.candidate_ids()?;
        Ok(())
    }

    /// Configured slots, or `candidate-N` for each deploy candidate.
    pub fn slots(&self) -> Result<Vec<SlotSpec>, ConfigError> {
        if !self.view.slots.is_empty() {
            return Ok(self.view.slots.clone());
        }
        Ok(SlotSpec::numbered(&self.deploy.candidate_ids()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_layers() {
        let show = |f: EnvFilter| f.to_string();
        assert_eq!(show(log_filter(Some("debug"), Some("trace"), "warn")), "debug");
        assert_eq!(show(log_filter(None, Some("tally_deploy=trace"), "warn")), "tally_deploy=trace");
        assert_eq!(show(log_filter(None, None, "warn")), "warn");
        assert_eq!(show(log_filter(Some("tally_deploy=loud"), Some("info"), "warn")), "info");
        assert_eq!(show(log_filter(None, Some("tally_deploy=loud"), "warn")), "warn");
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = TallyConfig::from_toml("").unwrap();
        assert_eq!(config, TallyConfig::default());
        assert_eq!(config.deploy.gas_limit, 4_700_000);
        assert_eq!(config.deploy.descriptor, PathBuf::from("contract.json"));
        assert_eq!(config.ledger.endpoint, Endpoint::Local);
    }

    #[test]
    fn missing_file_is_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TallyConfig::load(&dir.path().join("tally.toml")).unwrap();
        assert_eq!(config, TallyConfig::default());
    }

    #[test]
    fn demo_config_parses() {
        let config = TallyConfig::from_toml(include_str!("../../demos/tally.toml")).unwrap();
        assert_eq!(config.ledger.endpoint, Endpoint::Rpc("127.0.0.1:8545".into()));
        let slots = config.slots().unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].slot, "candidate-1");
        assert_eq!(slots[0].candidate, Bytes32::from_name("Rama").unwrap());
    }

    #[test]
    fn slots_default_to_numbered_candidates() {
        let config = TallyConfig::from_toml("[deploy]\ncandidates = [\"A\", \"B\"]\n").unwrap();
        let slots = config.slots().unwrap();
        assert_eq!(slots[1].slot, "candidate-2");
        assert_eq!(slots[1].candidate, Bytes32::from_name("B").unwrap());
    }

    #[test]
    fn bad_values_are_refused() {
        assert!(matches!(
            TallyConfig::from_toml("[ledger]\npoll_interval_ms = 0\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            TallyConfig::from_toml("[deploy]\naccount = 10\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            TallyConfig::from_toml("[deploy]\ncandidates = [\"a-name-that-is-longer-than-thirty-two-bytes\"]\n"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            TallyConfig::from_toml("[ledger]\nendpont = \"local\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = TallyConfig::default();
        config.ledger.endpoint = Endpoint::Rpc("10.0.0.2:8545".into());
        let text = config.to_toml().unwrap();
        assert_eq!(TallyConfig::from_toml(&text).unwrap(), config);
    }
}
