//! Domain model types for WG Remote

use chrono::{DateTime, Local};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use uuid::Uuid;

/// How to authenticate against a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HostAuth {
    Password {
        password: String,
    },
    PrivateKey {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

fn default_ssh_port() -> u16 {
    22
}

/// Credentials for one remote host, keyed by a server id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCredential {
    pub id: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: HostAuth,
}

impl HostCredential {
    pub fn with_password(
        id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            auth: HostAuth::Password {
                password: password.into(),
            },
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Validate the credential before use
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Server id cannot be empty".to_string());
        }
        if self.host.trim().is_empty() {
            return Err("Host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("Port must be greater than 0".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("Username cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Activation status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl ActivationStatus {
    pub fn display_name(&self) -> &'static str {
        match self {
            ActivationStatus::Active => "Active",
            ActivationStatus::Inactive => "Inactive",
            ActivationStatus::Unknown => "Unknown",
        }
    }
}

/// Where a piece of discovery evidence came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    DirectoryListing,
    LiveStatus,
    PeerFileGlob,
    ServiceStatus,
    KernelModule,
    InterfaceListing,
}

impl EvidenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceSource::DirectoryListing => "directory-listing",
            EvidenceSource::LiveStatus => "live-status",
            EvidenceSource::PeerFileGlob => "peer-file-glob",
            EvidenceSource::ServiceStatus => "service-status",
            EvidenceSource::KernelModule => "kernel-module",
            EvidenceSource::InterfaceListing => "interface-listing",
        }
    }
}

/// Which recovery step produced the canonical config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    PrimaryFile,
    LiveInterface,
    LiveAttributes,
    PeerDerived,
}

/// An inclusive range of forwarded UDP ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn count(&self) -> u32 {
        u32::from(self.end.saturating_sub(self.start)) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// How the forwarded port range of an instance was learned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSource {
    PostUpRule,
    FirewallRules,
    ServiceLog,
    NameArithmetic,
    ListenPort,
}

/// Forwarded range plus its provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub range: PortRange,
    pub source: RangeSource,
}

/// One client permitted to connect to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub ordinal: u32,
    pub address: Option<Ipv4Addr>,
    pub public_key: Option<String>,
    pub config: String,
    pub file: String,
}

/// Cheap listing entry for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub name: String,
    pub status: ActivationStatus,
    pub sources: Vec<EvidenceSource>,
}

/// Reconciled view of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstanceDetail {
    pub name: String,
    pub status: ActivationStatus,
    pub config: Option<String>,
    pub config_source: Option<ConfigSource>,
    /// Server address with prefix, e.g. `10.0.1.1/24`
    pub address: Option<Ipv4Net>,
    pub listen_port: Option<u16>,
    pub public_key: Option<String>,
    /// Path of the private key file, never the key itself
    pub private_key_ref: Option<String>,
    pub port_mapping: Option<PortMapping>,
    pub public_address: Option<Ipv4Addr>,
    pub peers: Vec<Peer>,
    pub warnings: Vec<String>,
}

impl InstanceDetail {
    pub fn subnet(&self) -> Option<Ipv4Net> {
        self.address.map(|a| a.trunc())
    }
}

/// Proposed identifiers for a new peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAllocation {
    pub ordinal: u32,
    pub address: Ipv4Addr,
}

/// Proposed identifiers for a new instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAllocation {
    pub ordinal: u32,
    pub name: String,
    pub listen_port: u16,
    pub forward_range: PortRange,
    /// Server address with prefix, e.g. `10.0.2.1/24`
    pub server_address: Ipv4Net,
}

impl InstanceAllocation {
    pub fn subnet(&self) -> Ipv4Net {
        self.server_address.trunc()
    }
}

/// Lifecycle of one provisioning operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Starting,
    InstallingDependencies,
    ScriptUploaded,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl ProvisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisionState::Succeeded
                | ProvisionState::Failed
                | ProvisionState::TimedOut
                | ProvisionState::Cancelled
        )
    }
}

/// Progress notification emitted while provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub operation_id: Uuid,
    pub percent: u8,
    pub message: String,
    pub state: ProvisionState,
    pub at: DateTime<Local>,
}

/// A client config file found on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfigFile {
    pub path: String,
    pub name: String,
    pub content: String,
}

/// Outcome of a provisioning operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub operation_id: Uuid,
    pub state: ProvisionState,
    pub success: bool,
    pub warning: Option<String>,
    pub instances: Vec<String>,
    pub client_configs: Vec<ClientConfigFile>,
    pub output: String,
}

/// Outcome of adding a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerResult {
    pub instance: String,
    pub ordinal: u32,
    pub address: Ipv4Addr,
    pub public_key: String,
    pub config: String,
    pub file: String,
}

/// Acknowledgement of a completed mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message: String,
}

/// Validates an interface name the way wg-quick does
pub fn validate_instance_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Instance name cannot be empty".to_string());
    }
    if name.len() > 15 {
        return Err("Instance name must be 15 characters or less".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'))
    {
        return Err(
            "Instance name must contain only letters, numbers and the characters _=+.-".to_string(),
        );
    }
    Ok(())
}

/// Ordinal of a `wgN` style instance name
pub fn instance_ordinal(name: &str) -> Option<u32> {
    name.strip_prefix("wg")?.parse().ok()
}
