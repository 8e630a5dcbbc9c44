//! Error types for the wg-remote-core crate

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-checkable classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    SessionNotFound,
    CommandRejected,
    InstanceNotFound,
    PeerNotFound,
    SubnetExhausted,
    NoPublicAddress,
    Lifecycle,
    Provisioning,
    Config,
    Validation,
    Io,
    Parse,
}

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectHint {
    AuthenticationFailed,
    KeyRejected,
    TimedOut,
    Refused,
    Unresolvable,
    Other,
}

impl ConnectHint {
    pub fn advice(&self) -> &'static str {
        match self {
            ConnectHint::AuthenticationFailed => {
                "Authentication failed. Check the password and that the server allows password login"
            }
            ConnectHint::KeyRejected => {
                "Key authentication failed. Check the key format and that the public key is installed on the server"
            }
            ConnectHint::TimedOut => {
                "Connection timed out. Check the host address, port and firewall settings"
            }
            ConnectHint::Refused => {
                "Connection refused. Check that the SSH service is running and the port is correct"
            }
            ConnectHint::Unresolvable => "Host does not exist. Check the server address",
            ConnectHint::Other => "SSH connection failed",
        }
    }
}

/// Step of a peer add/remove that failed after the host may have been mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    ReadServerConfig,
    GenerateKeys,
    WriteClientConfig,
    AppendServerPeer,
    RewriteServerConfig,
    DeletePeerFiles,
    RestartService,
}

impl std::fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleStep::ReadServerConfig => "read server config",
            LifecycleStep::GenerateKeys => "generate keys",
            LifecycleStep::WriteClientConfig => "write client config",
            LifecycleStep::AppendServerPeer => "append server peer",
            LifecycleStep::RewriteServerConfig => "rewrite server config",
            LifecycleStep::DeletePeerFiles => "delete peer files",
            LifecycleStep::RestartService => "restart service",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection to {host}:{port} failed: {message} ({})", hint.advice())]
    Connection {
        host: String,
        port: u16,
        hint: ConnectHint,
        message: String,
    },

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("No active session for host '{0}'")]
    SessionNotFound(String),

    #[error("'{program}' is an interactive command and cannot run here. {suggestion}")]
    CommandRejected { program: String, suggestion: String },

    #[error("WireGuard instance '{0}' does not exist")]
    InstanceNotFound(String),

    #[error("Peer {ordinal} of instance '{instance}' not found")]
    PeerNotFound { instance: String, ordinal: u32 },

    #[error("No free address left in subnet {0}")]
    SubnetExhausted(String),

    #[error("Could not determine a public IPv4 address for instance '{0}'")]
    NoPublicAddress(String),

    #[error("Peer operation on '{instance}' failed at step '{step}': {message}")]
    Lifecycle {
        instance: String,
        step: LifecycleStep,
        message: String,
    },

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn provisioning(msg: impl Into<String>) -> Self {
        Error::Provisioning(msg.into())
    }

    pub fn lifecycle(instance: &str, step: LifecycleStep, msg: impl Into<String>) -> Self {
        Error::Lifecycle {
            instance: instance.to_string(),
            step,
            message: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Config(_) | Error::Serialization(_) | Error::Deserialization(_) => {
                ErrorKind::Config
            }
            Error::Validation(_) => ErrorKind::Validation,
            Error::Connection { .. } | Error::Ssh(_) => ErrorKind::Connectivity,
            Error::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Error::CommandRejected { .. } => ErrorKind::CommandRejected,
            Error::InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            Error::PeerNotFound { .. } => ErrorKind::PeerNotFound,
            Error::SubnetExhausted(_) => ErrorKind::SubnetExhausted,
            Error::NoPublicAddress(_) => ErrorKind::NoPublicAddress,
            Error::Lifecycle { .. } => ErrorKind::Lifecycle,
            Error::Provisioning(_) => ErrorKind::Provisioning,
            Error::Parse(_) | Error::Json(_) => ErrorKind::Parse,
        }
    }
}
