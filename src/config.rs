//! Service configuration.
//!
//! Everything is read from `RHYTHM_*` environment variables once at
//! startup. Only the Mesos master address list is required.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// ZooKeeper authentication mode.
#[derive(Debug, Clone)]
pub enum ZkAuth {
    World,
    Digest { user: String, password: String },
}

/// ZooKeeper connection settings, shared by the store and coordinators.
#[derive(Debug, Clone)]
pub struct ZkConfig {
    pub addrs: Vec<String>,
    /// Base path for all nodes, e.g. `/rhythm`.
    pub dir: String,
    pub timeout: Duration,
    pub auth: ZkAuth,
}

impl ZkConfig {
    /// Cluster string accepted by the client: comma-separated hosts.
    pub fn cluster(&self) -> String {
        self.addrs.join(",")
    }
}

/// Vault secrets backend settings.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub addr: String,
    pub token: String,
    /// Path prefix under which logical paths are resolved.
    pub root: String,
    pub timeout: Duration,
}

/// Secrets backend selection.
#[derive(Debug, Clone)]
pub enum SecretsBackend {
    None,
    Vault(VaultConfig),
}

/// Mesos framework settings.
#[derive(Debug, Clone)]
pub struct MesosConfig {
    /// Master base URLs, e.g. `http://10.0.0.1:5050`.
    pub addrs: Vec<String>,
    /// Framework role; `*` means no reservation.
    pub role: String,
    pub user: String,
    pub principal: String,
    pub hostname: String,
    pub webui_url: String,
    pub checkpoint: bool,
    pub failover_timeout: Duration,
    /// Basic auth credentials, if the masters require them.
    pub auth: Option<(String, String)>,
    pub labels: BTreeMap<String, String>,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_addr: SocketAddr,
    pub zookeeper: ZkConfig,
    pub task_ttl: Duration,
    pub mesos: MesosConfig,
    pub secrets: SecretsBackend,
    pub tuner_interval: Duration,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

fn parse_secs(name: &str, default: u64) -> Result<Duration> {
    match var(name) {
        Some(raw) => {
            let secs: u64 = raw.parse().with_context(|| format!("invalid {name}"))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(Duration::from_secs(default)),
    }
}

fn parse_millis(name: &str, default: u64) -> Result<Duration> {
    match var(name) {
        Some(raw) => {
            let millis: u64 = raw.parse().with_context(|| format!("invalid {name}"))?;
            Ok(Duration::from_millis(millis))
        }
        None => Ok(Duration::from_millis(default)),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_pairs(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_addr = var_or("RHYTHM_API_ADDR", "127.0.0.1:8000")
            .parse()
            .context("invalid RHYTHM_API_ADDR")?;

        let auth = match var_or("RHYTHM_ZK_AUTH_SCHEME", "world").as_str() {
            "world" => ZkAuth::World,
            "digest" => {
                let raw = var("RHYTHM_ZK_AUTH_DIGEST")
                    .context("RHYTHM_ZK_AUTH_DIGEST required for digest auth")?;
                let Some((user, password)) = raw.split_once(':') else {
                    bail!("RHYTHM_ZK_AUTH_DIGEST must be user:password");
                };
                ZkAuth::Digest {
                    user: user.to_string(),
                    password: password.to_string(),
                }
            }
            other => bail!("unknown ZooKeeper auth scheme: {other}"),
        };

        let mut dir = var_or("RHYTHM_ZK_DIR", "/rhythm");
        if !dir.starts_with('/') {
            dir.insert(0, '/');
        }
        let zookeeper = ZkConfig {
            addrs: parse_list(&var_or("RHYTHM_ZK_ADDRS", "127.0.0.1:2181")),
            dir: dir.trim_end_matches('/').to_string(),
            timeout: parse_millis("RHYTHM_ZK_TIMEOUT_MS", 10_000)?,
            auth,
        };

        let mesos_addrs = parse_list(&var("RHYTHM_MESOS_ADDRS").context("RHYTHM_MESOS_ADDRS is required")?);
        if mesos_addrs.is_empty() {
            bail!("RHYTHM_MESOS_ADDRS must list at least one master");
        }
        let mesos_auth = match var("RHYTHM_MESOS_AUTH_BASIC") {
            Some(raw) => {
                let Some((user, password)) = raw.split_once(':') else {
                    bail!("RHYTHM_MESOS_AUTH_BASIC must be user:password");
                };
                Some((user.to_string(), password.to_string()))
            }
            None => None,
        };
        let mesos = MesosConfig {
            addrs: mesos_addrs,
            role: var_or("RHYTHM_MESOS_ROLE", "*"),
            user: var_or("RHYTHM_MESOS_USER", "root"),
            principal: var_or("RHYTHM_MESOS_PRINCIPAL", ""),
            hostname: var_or("RHYTHM_MESOS_HOSTNAME", ""),
            webui_url: var_or("RHYTHM_MESOS_WEBUI_URL", ""),
            checkpoint: var_or("RHYTHM_MESOS_CHECKPOINT", "true") != "false",
            failover_timeout: parse_secs("RHYTHM_MESOS_FAILOVER_TIMEOUT_SECS", 7 * 24 * 60 * 60)?,
            auth: mesos_auth,
            labels: parse_pairs(&var_or("RHYTHM_MESOS_LABELS", "")),
        };

        let secrets = match var_or("RHYTHM_SECRETS_BACKEND", "none").as_str() {
            "none" => SecretsBackend::None,
            "vault" => SecretsBackend::Vault(VaultConfig {
                addr: var("RHYTHM_VAULT_ADDR").context("RHYTHM_VAULT_ADDR required for vault")?,
                token: var("RHYTHM_VAULT_TOKEN").context("RHYTHM_VAULT_TOKEN required for vault")?,
                root: var_or("RHYTHM_VAULT_ROOT", "secret/rhythm/"),
                timeout: parse_millis("RHYTHM_VAULT_TIMEOUT_MS", 3_000)?,
            }),
            other => bail!("unknown secrets backend: {other}"),
        };

        Ok(Self {
            api_addr,
            zookeeper,
            task_ttl: parse_secs("RHYTHM_TASK_TTL_SECS", 7 * 24 * 60 * 60)?,
            mesos,
            secrets,
            tuner_interval: parse_secs("RHYTHM_TUNER_INTERVAL_SECS", 30)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_strips_slashes_and_blanks() {
        assert_eq!(
            parse_list("http://m1:5050/, http://m2:5050 ,"),
            vec!["http://m1:5050".to_string(), "http://m2:5050".to_string()]
        );
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("team=infra, tier=batch");
        assert_eq!(pairs.get("team").unwrap(), "infra");
        assert_eq!(pairs.get("tier").unwrap(), "batch");
        assert!(parse_pairs("").is_empty());
    }
}
