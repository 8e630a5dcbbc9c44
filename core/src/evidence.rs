//! Discovery probes and instance-name extraction
//!
//! Each probe is a read-only command whose output may be empty, missing or
//! contradict the others. A failing probe contributes no evidence and never
//! aborts the battery.

use crate::session::{quote, RemoteShell};
use crate::{validate_instance_name, EngineConfig, EvidenceSource};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Raw output of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvidence {
    pub source: EvidenceSource,
    /// Whether the probe's command ran successfully
    pub ok: bool,
    pub raw: String,
}

/// Probe order only affects log readability
pub const PROBES: &[EvidenceSource] = &[
    EvidenceSource::DirectoryListing,
    EvidenceSource::LiveStatus,
    EvidenceSource::PeerFileGlob,
    EvidenceSource::ServiceStatus,
    EvidenceSource::KernelModule,
    EvidenceSource::InterfaceListing,
];

pub fn probe_command(source: EvidenceSource, config: &EngineConfig) -> String {
    match source {
        EvidenceSource::DirectoryListing => {
            format!("ls -1 {} 2>/dev/null", quote(&config.paths.wireguard_dir))
        }
        EvidenceSource::LiveStatus => "wg show interfaces 2>/dev/null".to_string(),
        EvidenceSource::PeerFileGlob => format!(
            "find {} -maxdepth 1 -type f -name '*-peer*-client.conf' 2>/dev/null",
            quote(&config.paths.deploy_dir)
        ),
        EvidenceSource::ServiceStatus => {
            "systemctl list-units --all --plain --no-legend 'wg-quick@*' 2>/dev/null".to_string()
        }
        EvidenceSource::KernelModule => "lsmod 2>/dev/null | grep wireguard".to_string(),
        EvidenceSource::InterfaceListing => {
            "ip -o link show type wireguard 2>/dev/null".to_string()
        }
    }
}

/// Run every probe, best-effort
pub fn collect(shell: &dyn RemoteShell, config: &EngineConfig) -> Vec<DiscoveryEvidence> {
    PROBES
        .iter()
        .map(|&source| {
            let command = probe_command(source, config);
            let evidence = match shell.exec(&command) {
                Ok(out) => DiscoveryEvidence {
                    source,
                    ok: out.success(),
                    raw: if out.success() { out.stdout } else { String::new() },
                },
                Err(e) => {
                    log::debug!("[{}] probe {} failed: {}", shell.host_id(), source.as_str(), e);
                    DiscoveryEvidence {
                        source,
                        ok: false,
                        raw: String::new(),
                    }
                }
            };
            log::debug!(
                "[{}] probe {}: ok={} {}B",
                shell.host_id(),
                source.as_str(),
                evidence.ok,
                evidence.raw.len()
            );
            evidence
        })
        .collect()
}

fn peer_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|/)([^/\s]+?)-peer(\d+)-client\.conf$").expect("valid regex"))
}

fn service_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"wg-quick@([A-Za-z0-9_=+.-]+)\.service").expect("valid regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+:\s+([^:@\s]+)[:@]").expect("valid regex"))
}

/// Split a peer client-config path into instance name and peer ordinal
pub fn parse_peer_file(path: &str) -> Option<(String, u32)> {
    let caps = peer_file_re().captures(path.trim())?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

/// Instance names one piece of evidence points at
pub fn instance_names(evidence: &DiscoveryEvidence) -> BTreeSet<String> {
    let raw = evidence.raw.as_str();
    let names: BTreeSet<String> = match evidence.source {
        EvidenceSource::DirectoryListing => raw
            .lines()
            .map(str::trim)
            .filter(|l| parse_peer_file(l).is_none())
            .filter_map(|l| l.strip_suffix(".conf"))
            .map(str::to_string)
            .collect(),
        EvidenceSource::LiveStatus => raw.split_whitespace().map(str::to_string).collect(),
        EvidenceSource::PeerFileGlob => raw
            .lines()
            .filter_map(parse_peer_file)
            .map(|(name, _)| name)
            .collect(),
        EvidenceSource::ServiceStatus => service_re()
            .captures_iter(raw)
            .map(|c| c[1].to_string())
            .collect(),
        // proves the module is loaded but names nothing
        EvidenceSource::KernelModule => BTreeSet::new(),
        EvidenceSource::InterfaceListing => raw
            .lines()
            .filter_map(|l| link_re().captures(l.trim()))
            .map(|c| c[1].to_string())
            .collect(),
    };
    names
        .into_iter()
        .filter(|n| validate_instance_name(n).is_ok())
        .collect()
}

/// Union of all candidate names, each with the sources that mention it
pub fn candidates(evidence: &[DiscoveryEvidence]) -> BTreeMap<String, Vec<EvidenceSource>> {
    let mut out: BTreeMap<String, Vec<EvidenceSource>> = BTreeMap::new();
    for item in evidence {
        for name in instance_names(item) {
            let sources = out.entry(name).or_default();
            if !sources.contains(&item.source) {
                sources.push(item.source);
            }
        }
    }
    out
}

/// Evidence of one source, if it was collected
pub fn find(evidence: &[DiscoveryEvidence], source: EvidenceSource) -> Option<&DiscoveryEvidence> {
    evidence.iter().find(|e| e.source == source)
}
