//! Configuration management for engine settings and the host file

use crate::{Error, HostCredential, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current config version for migration support
pub const CONFIG_VERSION: u32 = 1;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: u32,
    pub paths: PathsSection,
    pub network: NetworkSection,
    pub ssh: SshSection,
    pub provision: ProvisionSection,
}

/// Remote filesystem locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsSection {
    /// Directory holding the canonical `<iface>.conf` files
    pub wireguard_dir: String,
    /// Directory holding key files and generated client configs
    pub deploy_dir: String,
    /// Where the provisioning script is uploaded
    pub script_path: String,
    /// Where the detached script writes its output
    pub log_path: String,
    /// Where the detached script's pid is recorded
    pub pid_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Listen port of instance 0
    pub base_listen_port: u16,
    /// Listen port increment per instance ordinal
    pub listen_port_step: u16,
    /// First forwarded port of instance 0
    pub base_forward_port: u16,
    /// Forwarded ports per instance
    pub forward_range_size: u16,
    /// First two octets of every instance subnet
    pub subnet_prefix: String,
    /// DNS server written into client configs
    pub dns: String,
    /// PersistentKeepalive written into client configs
    pub persistent_keepalive: u16,
    /// Listen port assumed when nothing else is known
    pub default_listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSection {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionSection {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    /// Budget for the package manager run, which outlasts ordinary commands
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
}

fn default_install_timeout_secs() -> u64 {
    900
}

impl Default for EngineConfig {
    fn default() -> Self {
        let deploy_dir = "/root/VPS配置WG".to_string();
        Self {
            version: CONFIG_VERSION,
            paths: PathsSection {
                wireguard_dir: "/etc/wireguard".to_string(),
                script_path: "/root/wg-remote-provision.sh".to_string(),
                log_path: "/root/wg-remote-provision.log".to_string(),
                pid_path: "/root/wg-remote-provision.pid".to_string(),
                deploy_dir,
            },
            network: NetworkSection {
                base_listen_port: 52835,
                listen_port_step: 10,
                base_forward_port: 55835,
                forward_range_size: 1000,
                subnet_prefix: "10.0".to_string(),
                dns: "1.1.1.1".to_string(),
                persistent_keepalive: 25,
                default_listen_port: 51820,
            },
            ssh: SshSection {
                connect_timeout_secs: 30,
                command_timeout_secs: 120,
            },
            provision: ProvisionSection {
                poll_interval_ms: 3000,
                timeout_secs: 1800,
                install_timeout_secs: default_install_timeout_secs(),
            },
        }
    }
}

impl EngineConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("wg-remote")
            .join("config.toml")
    }

    /// Load config from file, or create default if not exists
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config from a specific path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        if config.version != CONFIG_VERSION {
            log::warn!(
                "config {} has version {}, expected {}",
                path.display(),
                config.version,
                CONFIG_VERSION
            );
        }
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.paths.wireguard_dir.starts_with('/') || !self.paths.deploy_dir.starts_with('/') {
            return Err(Error::validation("Remote directories must be absolute paths"));
        }
        if self.network.listen_port_step == 0 {
            return Err(Error::validation("Listen port step must be greater than 0"));
        }
        if self.network.forward_range_size == 0 {
            return Err(Error::validation("Forward range size must be greater than 0"));
        }
        let octets: Vec<&str> = self.network.subnet_prefix.split('.').collect();
        if octets.len() != 2 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
            return Err(Error::validation(
                "Subnet prefix must be two dotted octets, e.g. 10.0",
            ));
        }
        if self.provision.timeout_secs == 0 {
            return Err(Error::validation("Provision timeout must be greater than 0"));
        }
        if self.provision.install_timeout_secs == 0 {
            return Err(Error::validation("Install timeout must be greater than 0"));
        }
        Ok(())
    }

    /// Canonical server config path of an instance
    pub fn server_config_path(&self, instance: &str) -> String {
        format!("{}/{}.conf", self.paths.wireguard_dir, instance)
    }

    pub fn server_key_path(&self, instance: &str) -> String {
        format!("{}/{}-server.key", self.paths.deploy_dir, instance)
    }

    pub fn server_pub_path(&self, instance: &str) -> String {
        format!("{}/{}-server.pub", self.paths.deploy_dir, instance)
    }

    pub fn peer_key_path(&self, instance: &str, ordinal: u32) -> String {
        format!("{}/{}-peer{}.key", self.paths.deploy_dir, instance, ordinal)
    }

    pub fn peer_pub_path(&self, instance: &str, ordinal: u32) -> String {
        format!("{}/{}-peer{}.pub", self.paths.deploy_dir, instance, ordinal)
    }

    pub fn client_config_path(&self, instance: &str, ordinal: u32) -> String {
        format!(
            "{}/{}-peer{}-client.conf",
            self.paths.deploy_dir, instance, ordinal
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.provision.poll_interval_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision.timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.provision.install_timeout_secs)
    }
}

/// Source of host credentials, keyed by server id
pub trait CredentialStore {
    fn credential(&self, server_id: &str) -> Option<HostCredential>;
}

/// TOML file listing the known hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HostFile {
    #[serde(default)]
    pub hosts: Vec<HostCredential>,
}

impl HostFile {
    /// Get the default host file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("wg-remote")
            .join("hosts.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let file: Self = toml::from_str(&content)?;
        for host in &file.hosts {
            host.validate().map_err(Error::validation)?;
        }
        Ok(file)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Add a host, rejecting duplicate ids
    pub fn add(&mut self, host: HostCredential) -> Result<()> {
        host.validate().map_err(Error::validation)?;
        if self.hosts.iter().any(|h| h.id == host.id) {
            return Err(Error::validation(format!(
                "Host with id '{}' already exists",
                host.id
            )));
        }
        self.hosts.push(host);
        Ok(())
    }
}

impl CredentialStore for HostFile {
    fn credential(&self, server_id: &str) -> Option<HostCredential> {
        self.hosts.iter().find(|h| h.id == server_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.network.base_listen_port, 52835);
        assert_eq!(config.network.forward_range_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = EngineConfig::default();
        config.provision.poll_interval_ms = 500;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_install_timeout_defaults_when_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let text = toml::to_string_pretty(&EngineConfig::default())
            .unwrap()
            .replace("install_timeout_secs = 900\n", "");
        assert!(!text.contains("install_timeout_secs"));
        std::fs::write(&path, text).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.install_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn test_invalid_subnet_prefix_rejected() {
        let mut config = EngineConfig::default();
        config.network.subnet_prefix = "10.0.0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_paths() {
        let config = EngineConfig::default();
        assert_eq!(config.server_config_path("wg0"), "/etc/wireguard/wg0.conf");
        assert!(config
            .client_config_path("wg1", 3)
            .ends_with("/wg1-peer3-client.conf"));
    }

    #[test]
    fn test_host_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts.toml");

        let mut file = HostFile::default();
        file.add(HostCredential::with_password(
            "vps-1",
            "203.0.113.5",
            "root",
            "secret",
        ))
        .unwrap();
        assert!(file
            .add(HostCredential::with_password("vps-1", "h", "root", "x"))
            .is_err());
        file.save_to(&path).unwrap();

        let loaded = HostFile::load(&path).unwrap();
        assert_eq!(loaded.credential("vps-1").unwrap().host, "203.0.113.5");
        assert!(loaded.credential("vps-2").is_none());
    }
}
