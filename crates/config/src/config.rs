use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use mirach_primitives::params::Params;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Document-store directory.
    pub db_dir: PathBuf,

    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Directory for the binary block store.  Unset means blocks persist
    /// into the document store instead.
    #[serde(default)]
    pub blocks_dir: Option<PathBuf>,

    /// `dev` switches to the development upstream endpoint set.
    #[serde(default)]
    pub node_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SteemConfig {
    /// Upstream RPC endpoints, tried in pool order.
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct P2pConfig {
    /// Listen address, `host:port`.
    pub bind: String,

    /// The canonical port peers should dial us back on.
    pub port: u16,

    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WitnessConfig {
    /// Our account name on the chain.
    #[serde(default)]
    pub account: Option<String>,

    /// bs58 secp256k1 secret key; unset means this node never mines.
    #[serde(default)]
    pub private_key: Option<String>,

    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub notifications: bool,

    #[serde(default)]
    pub tx_history: bool,

    #[serde(default)]
    pub witness_stats: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    pub steem: SteemConfig,
    pub p2p: P2pConfig,

    #[serde(default)]
    pub witness: WitnessConfig,

    #[serde(default)]
    pub features: FeaturesConfig,

    #[serde(default)]
    pub params: Params,
}

fn default_db_name() -> String {
    "mirach".to_owned()
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Env vars are the primary operational levers and beat the file.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DB_DIR") {
            self.client.db_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DB_NAME") {
            self.client.db_name = v;
        }
        if let Ok(v) = std::env::var("BLOCKS_DIR") {
            self.client.blocks_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("NODE_ENV") {
            self.client.node_env = Some(v);
        }
        if let Ok(v) = std::env::var("STEEM_API") {
            self.steem.endpoints = split_list(&v);
        }
        if let Ok(v) = std::env::var("PEERS") {
            self.p2p.bootstrap_peers = split_list(&v);
        }
        if let Ok(v) = std::env::var("STEEM_ACCOUNT") {
            self.witness.account = Some(v);
        }
        if let Ok(v) = std::env::var("WITNESS_PRIVATE_KEY") {
            self.witness.private_key = Some(v);
        }
        if let Ok(v) = std::env::var("WITNESS_PUBLIC_KEY") {
            self.witness.public_key = Some(v);
        }
        if let Some(v) = env_usize("WARMUP_ACCOUNTS") {
            self.params.run.warmup_accounts = v;
        }
        if let Some(v) = env_usize("WARMUP_TOKENS") {
            self.params.run.warmup_tokens = v;
        }
        self.features.notifications |= env_flag("NOTIFICATIONS");
        self.features.tx_history |= env_flag("TX_HISTORY");
        self.features.witness_stats |= env_flag("WITNESS_STATS");

        // Dev runs live on a separate chain id so dev custom_json ops
        // never collide with mainnet ones.
        if self.client.node_env.as_deref() == Some("dev")
            && !self.params.chain.chain_id.ends_with("-dev")
        {
            self.params.chain.chain_id = format!("{}-dev", self.params.chain.chain_id);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.steem.endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one upstream endpoint is required".to_owned(),
            ));
        }
        if self.witness.private_key.is_some() && self.witness.account.is_none() {
            return Err(ConfigError::Invalid(
                "a witness key needs an account name".to_owned(),
            ));
        }
        Ok(())
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_load() {
        let raw = r#"
            [client]
            db_dir = "/var/lib/mirach"
            blocks_dir = "/var/lib/mirach/blocks"

            [steem]
            endpoints = ["https://api.example.com", "https://api2.example.com"]

            [p2p]
            bind = "0.0.0.0:6001"
            port = 6001
            bootstrap_peers = ["ws://peer1:6001"]

            [witness]
            account = "alice"

            [params.chain]
            block_time_ms = 3000
        "#;
        let config: Config = toml::from_str(raw).expect("test: parse");
        assert_eq!(config.steem.endpoints.len(), 2);
        assert_eq!(config.client.db_name, "mirach");
        assert_eq!(config.params.chain.block_time_ms, 3000);
        assert!(!config.features.notifications);
        config.validate().expect("test: valid");
    }

    #[test]
    fn test_missing_endpoints_invalid() {
        let raw = r#"
            [client]
            db_dir = "/tmp/x"

            [steem]
            endpoints = []

            [p2p]
            bind = "0.0.0.0:6001"
            port = 6001
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,,c"), vec!["a", "b", "c"]);
    }
}
