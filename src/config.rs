use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

/// CLI args for the hoarder process.
///
/// Mirrors the flags of the original `emd` binary: `--secrets`,
/// `--dump_dir`, `--history`, `--structure`.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "EVE market data hoarder")]
pub struct HoarderArgs {
    /// JSON object mapping secret name to string value
    #[arg(long, default_value = "{}")]
    pub secrets: String,

    /// Directory in which dumps will be created
    #[arg(long = "dump_dir", default_value = ".")]
    pub dump_dir: PathBuf,

    /// Enable the histories worker
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub history: bool,

    /// Enable the locations worker (requires ssoClientId, ssoClientSecret,
    /// ssoRefreshToken secrets)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub structure: bool,

    /// CSV seed of region IDs to sweep (external collaborator: the core
    /// only consumes "a sequence of region IDs")
    #[arg(long = "regions_csv", default_value = "regions.csv")]
    pub regions_csv: PathBuf,

    /// CSV seed of solar system security ratings
    #[arg(long = "systems_csv", default_value = "systems.csv")]
    pub systems_csv: PathBuf,

    /// CSV seed of baseline (NPC station) locations
    #[arg(long = "locations_csv", default_value = "stations.csv")]
    pub locations_csv: PathBuf,
}

/// Secrets required when `--structure` is enabled.
pub const SSO_CLIENT_ID: &str = "ssoClientId";
pub const SSO_CLIENT_SECRET: &str = "ssoClientSecret";
pub const SSO_REFRESH_TOKEN: &str = "ssoRefreshToken";

const SECRET_COUNT_MAX: usize = 16;

/// Given-a-key-return-a-value-or-fail secrets store. The backing
/// implementation (vault, env, file) is an external collaborator; this
/// core only consumes the `{key: value}` JSON shape produced by
/// `--secrets`.
#[derive(Debug, Clone, Default)]
pub struct SecretTable {
    entries: HashMap<String, String>,
}

impl SecretTable {
    pub fn parse(json: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(json).context("secrets: invalid json")?;
        let object = value
            .as_object()
            .context("secrets: invalid format, want {key: value, ...}")?;
        if object.len() > SECRET_COUNT_MAX {
            bail!("secrets: you got too many secrets...");
        }
        let mut entries = HashMap::with_capacity(object.len());
        for (key, value) in object {
            let value = value
                .as_str()
                .with_context(|| format!("secrets: value for \"{key}\" is not a string"))?;
            entries.insert(key.clone(), value.to_string());
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .with_context(|| format!("secret \"{key}\" not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_secrets() {
        let table = SecretTable::parse(r#"{"ssoClientId": "abc"}"#).unwrap();
        assert_eq!(table.get("ssoClientId").unwrap(), "abc");
    }

    #[test]
    fn missing_key_errors() {
        let table = SecretTable::parse("{}").unwrap();
        assert!(table.get("nope").is_err());
    }

    #[test]
    fn rejects_non_object() {
        assert!(SecretTable::parse("[1,2,3]").is_err());
    }

    #[test]
    fn rejects_non_string_values() {
        assert!(SecretTable::parse(r#"{"a": 1}"#).is_err());
    }

    #[test]
    fn rejects_too_many_secrets() {
        let mut map = serde_json::Map::new();
        for i in 0..(SECRET_COUNT_MAX + 1) {
            map.insert(format!("k{i}"), serde_json::Value::String("v".into()));
        }
        let json = serde_json::Value::Object(map).to_string();
        assert!(SecretTable::parse(&json).is_err());
    }
}
