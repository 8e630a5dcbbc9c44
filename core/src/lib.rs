//! WireGuard Remote Core Library
//!
//! This crate discovers, reconciles and provisions WireGuard instances on
//! remote Linux hosts over SSH. Everything it knows about a host comes from
//! commands run through a [`RemoteShell`]; nothing is cached between calls.

pub mod allocate;
pub mod config;
pub mod diagnose;
pub mod endpoint;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod lifecycle;
pub mod mock;
pub mod model;
pub mod provision;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod synth;
pub mod wg_config;

pub use config::{CredentialStore, EngineConfig, HostFile};
pub use diagnose::{diagnose, DiagnosticReport, DiagnosticSection};
pub use error::{ConnectHint, Error, ErrorKind, LifecycleStep, Result};
pub use executor::execute;
pub use lifecycle::PeerManager;
pub use model::*;
pub use provision::{provision, ProvisionHandle, MILESTONES};
pub use reconcile::{get_instance_details, list_instances, Reconciler};
pub use session::{CommandOutput, RemoteShell, SessionHandle, SessionRegistry, SshShell};
pub use wg_config::{Section, WgConfig};

/// Open an SSH session for `credential` and register it
pub fn connect(
    registry: &SessionRegistry,
    credential: &HostCredential,
    config: &EngineConfig,
) -> Result<SessionHandle> {
    registry.connect(credential, config)
}
