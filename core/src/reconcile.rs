//! Reconciliation of discovery evidence into canonical instance state
//!
//! Facts with more than one possible source are recovered through ordered
//! chains of fallible steps. The first step that yields a value wins, and a
//! step that finds nothing, or whose command errors, falls through to the
//! next one instead of failing the whole reconciliation.

use crate::endpoint::{self, EndpointQuery};
use crate::evidence::{self, DiscoveryEvidence};
use crate::remote;
use crate::session::{quote, RemoteShell};
use crate::synth::{self, ClientParams};
use crate::wg_config::{is_valid_key, Section, WgConfig};
use crate::{
    allocate, instance_ordinal, validate_instance_name, ActivationStatus, ConfigSource,
    EngineConfig, Error, EvidenceSource, InstanceDetail, InstanceSummary, Peer, PortMapping,
    PortRange, RangeSource, Result,
};
use ipnet::Ipv4Net;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

fn seq_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"seq\s+(\d+)\s+(\d+)").expect("valid regex"))
}

fn dport_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--dport\s+(\d+)(?::(\d+))?").expect("valid regex"))
}

fn to_destination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--to-destination\s+[0-9.]+:(\d+)").expect("valid regex"))
}

/// Reads and reconciles the WireGuard state of one host
pub struct Reconciler<'a> {
    shell: &'a dyn RemoteShell,
    config: &'a EngineConfig,
}

type ConfigStep = fn(&Reconciler<'_>, &str) -> Result<Option<String>>;

const CONFIG_CHAIN: &[(ConfigSource, ConfigStep)] = &[
    (ConfigSource::PrimaryFile, config_from_primary_file),
    (ConfigSource::LiveInterface, config_from_live_interface),
    (ConfigSource::LiveAttributes, config_from_live_attributes),
    (ConfigSource::PeerDerived, config_from_peer_configs),
];

/// What the port-range steps may look at
struct RangeInput<'a> {
    name: &'a str,
    server: Option<&'a WgConfig>,
    listen_port: Option<u16>,
}

type RangeStep = fn(&Reconciler<'_>, &RangeInput<'_>) -> Result<Option<PortRange>>;

const RANGE_CHAIN: &[(RangeSource, RangeStep)] = &[
    (RangeSource::PostUpRule, range_from_post_up),
    (RangeSource::FirewallRules, range_from_firewall),
    (RangeSource::ServiceLog, range_from_service_log),
    (RangeSource::NameArithmetic, range_from_name),
    (RangeSource::ListenPort, range_from_listen_port),
];

impl<'a> Reconciler<'a> {
    pub fn new(shell: &'a dyn RemoteShell, config: &'a EngineConfig) -> Self {
        Self { shell, config }
    }

    /// Every instance any probe points at, without recovering configs
    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        let evidence = evidence::collect(self.shell, self.config);
        evidence::candidates(&evidence)
            .into_iter()
            .map(|(name, sources)| InstanceSummary {
                status: activation_status(&name, &evidence),
                name,
                sources,
            })
            .collect()
    }

    /// Full reconciled view of all instances on the host
    pub fn snapshot(&self) -> Result<Vec<InstanceDetail>> {
        let evidence = evidence::collect(self.shell, self.config);
        evidence::candidates(&evidence)
            .keys()
            .map(|name| self.reconcile(name, &evidence))
            .collect()
    }

    pub fn instance_details(&self, name: &str) -> Result<InstanceDetail> {
        validate_instance_name(name).map_err(Error::validation)?;
        let evidence = evidence::collect(self.shell, self.config);
        if !evidence::candidates(&evidence).contains_key(name) {
            return Err(Error::InstanceNotFound(name.to_string()));
        }
        self.reconcile(name, &evidence)
    }

    fn reconcile(&self, name: &str, evidence: &[DiscoveryEvidence]) -> Result<InstanceDetail> {
        let mut detail = InstanceDetail {
            name: name.to_string(),
            status: activation_status(name, evidence),
            ..Default::default()
        };

        if let Some((source, text)) = self.recover_config(name) {
            if source != ConfigSource::PrimaryFile {
                let path = self.config.server_config_path(name);
                match self.shell.write_file(&path, &text, 0o600) {
                    Ok(()) => log::info!(
                        "[{}] persisted {} config recovered from {:?}",
                        self.shell.host_id(),
                        name,
                        source
                    ),
                    Err(e) => self.warn(&mut detail, format!("could not persist {}: {}", path, e)),
                }
            }
            detail.config_source = Some(source);
            detail.config = Some(text);
        } else {
            self.warn(&mut detail, "no configuration could be recovered".to_string());
        }

        let server = detail.config.as_deref().and_then(WgConfig::parse);
        if let Some(server) = &server {
            detail.address = server.interface.address();
            detail.listen_port = server.interface.listen_port();
        }
        detail.private_key_ref =
            self.or_default(name, "private key", self.private_key_ref(name, server.as_ref()));
        detail.public_key = self.or_default(name, "public key", self.server_public_key(name));

        if detail.status == ActivationStatus::Active
            && detail.config_source == Some(ConfigSource::PrimaryFile)
        {
            let checked = self.check_live_agreement(&mut detail);
            self.or_default(name, "live agreement", checked);
        }

        let input = RangeInput {
            name,
            server: server.as_ref(),
            listen_port: detail.listen_port,
        };
        detail.port_mapping = self.recover_range(&input);

        let query = EndpointQuery {
            instance: name,
            server: server.as_ref(),
            subnet: detail.subnet(),
            listen_port: detail.listen_port,
            config: self.config,
        };
        detail.public_address = endpoint::resolve(self.shell, &query).ok();

        let from_files = self.peers_from_files(name, server.as_ref());
        detail.peers = self.or_default(name, "peer files", from_files);
        if detail.peers.is_empty() {
            detail.peers = match self.peers_from_live(&mut detail) {
                Ok(peers) => peers,
                Err(e) => {
                    self.warn(&mut detail, format!("could not synthesize live peers: {}", e));
                    Vec::new()
                }
            };
        }

        Ok(detail)
    }

    fn warn(&self, detail: &mut InstanceDetail, message: String) {
        log::warn!("[{}] {}: {}", self.shell.host_id(), detail.name, message);
        detail.warnings.push(message);
    }

    /// A fact nobody could read counts as absent
    fn or_default<T: Default>(&self, name: &str, what: &str, result: Result<T>) -> T {
        result.unwrap_or_else(|e| {
            log::debug!("[{}] {}: no {}: {}", self.shell.host_id(), name, what, e);
            T::default()
        })
    }

    fn recover_config(&self, name: &str) -> Option<(ConfigSource, String)> {
        for (source, step) in CONFIG_CHAIN {
            match step(self, name) {
                Ok(Some(text)) => {
                    log::debug!("[{}] {} config from {:?}", self.shell.host_id(), name, source);
                    return Some((*source, text));
                }
                Ok(None) => {}
                Err(e) => log::debug!(
                    "[{}] {} config step {:?}: {}",
                    self.shell.host_id(),
                    name,
                    source,
                    e
                ),
            }
        }
        None
    }

    fn recover_range(&self, input: &RangeInput<'_>) -> Option<PortMapping> {
        for (source, step) in RANGE_CHAIN {
            match step(self, input) {
                Ok(Some(range)) => {
                    return Some(PortMapping {
                        range,
                        source: *source,
                    })
                }
                Ok(None) => {}
                Err(e) => log::debug!(
                    "[{}] {} range step {:?}: {}",
                    self.shell.host_id(),
                    input.name,
                    source,
                    e
                ),
            }
        }
        None
    }

    fn wg_show(&self, name: &str, field: &str) -> Result<Option<String>> {
        let out = self
            .shell
            .exec(&format!("wg show {} {} 2>/dev/null", quote(name), field))?;
        Ok(out.text().map(str::to_string))
    }

    /// `(public key, allowed networks)` of every peer on the live interface
    fn live_peers(&self, name: &str) -> Result<Vec<(String, Vec<Ipv4Net>)>> {
        let Some(text) = self.wg_show(name, "allowed-ips")? else {
            return Ok(Vec::new());
        };
        Ok(text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let key = fields.next().filter(|k| is_valid_key(k))?;
                let nets = fields.filter_map(|f| f.parse().ok()).collect();
                Some((key.to_string(), nets))
            })
            .collect())
    }

    fn read_key(&self, path: &str) -> Result<Option<String>> {
        Ok(remote::read_file(self.shell, path)?
            .map(|k| k.trim().to_string())
            .filter(|k| is_valid_key(k)))
    }

    fn private_key_ref(&self, name: &str, server: Option<&WgConfig>) -> Result<Option<String>> {
        let key_path = self.config.server_key_path(name);
        if remote::file_exists(self.shell, &key_path)? {
            return Ok(Some(key_path));
        }
        Ok(server
            .and_then(|s| s.interface.private_key())
            .map(|_| self.config.server_config_path(name)))
    }

    fn server_public_key(&self, name: &str) -> Result<Option<String>> {
        if let Some(key) = self.read_key(&self.config.server_pub_path(name))? {
            return Ok(Some(key));
        }
        Ok(self.wg_show(name, "public-key")?.filter(|k| is_valid_key(k)))
    }

    fn check_live_agreement(&self, detail: &mut InstanceDetail) -> Result<()> {
        let live_port = self
            .wg_show(&detail.name, "listen-port")?
            .and_then(|p| p.parse::<u16>().ok());
        if let (Some(file), Some(live)) = (detail.listen_port, live_port) {
            if file != live {
                self.warn(
                    detail,
                    format!("config listen port {} but live interface uses {}", file, live),
                );
            }
        }
        let live_net = endpoint::interface_network(self.shell, &detail.name);
        if let (Some(file), Some(live)) = (detail.address, live_net) {
            if file != live {
                self.warn(
                    detail,
                    format!("config address {} but live interface has {}", file, live),
                );
            }
        }
        Ok(())
    }

    fn peers_from_files(&self, name: &str, server: Option<&WgConfig>) -> Result<Vec<Peer>> {
        let pattern = format!("{}-peer*-client.conf", name);
        let mut peers = Vec::new();
        for path in remote::list_files(self.shell, &self.config.paths.deploy_dir, &pattern)? {
            let Some((instance, ordinal)) = evidence::parse_peer_file(&path) else {
                continue;
            };
            if instance != name {
                continue;
            }
            let Some(content) = remote::read_file(self.shell, &path)? else {
                continue;
            };
            let address = WgConfig::parse(&content)
                .and_then(|c| c.interface.address())
                .map(|n| n.addr());
            let public_key = match self.read_key(&self.config.peer_pub_path(name, ordinal))? {
                Some(key) => Some(key),
                None => address.and_then(|addr| key_for_address(server?, addr)),
            };
            peers.push(Peer {
                ordinal,
                address,
                public_key,
                config: content,
                file: path,
            });
        }
        peers.sort_by_key(|p| p.ordinal);
        Ok(peers)
    }

    /// Write client configs for peers only the live interface knows about
    ///
    /// A running interface never exposes peer private keys, so every peer
    /// gets a new one and the returned configs will not match the keys the
    /// real clients hold.
    fn peers_from_live(&self, detail: &mut InstanceDetail) -> Result<Vec<Peer>> {
        let name = detail.name.clone();
        let live = self.live_peers(&name)?;
        if live.is_empty() {
            return Ok(Vec::new());
        }
        let (Some(server_key), Some(endpoint), Some(net)) =
            (detail.public_key.clone(), detail.public_address, detail.address)
        else {
            self.warn(
                detail,
                format!(
                    "{} live peers have no client config and cannot be synthesized",
                    live.len()
                ),
            );
            return Ok(Vec::new());
        };
        let port = detail
            .listen_port
            .unwrap_or(self.config.network.default_listen_port);

        let mut peers = Vec::new();
        for (index, (public_key, nets)) in live.into_iter().enumerate() {
            let ordinal = index as u32 + 1;
            let Some(address) = nets.iter().find(|n| n.prefix_len() == 32).map(|n| n.addr()) else {
                continue;
            };
            let private_key = remote::generate_private_key(self.shell)?;
            let address_net = Ipv4Net::new(address, net.prefix_len())
                .map_err(|e| Error::parse(e.to_string()))?;
            let content = synth::client_config(
                &ClientParams {
                    private_key: &private_key,
                    address: address_net,
                    server_public_key: &server_key,
                    endpoint,
                    endpoint_port: port,
                },
                &self.config.network,
            );
            let file = self.config.client_config_path(&name, ordinal);
            self.shell.write_file(&file, &content, 0o600)?;
            self.shell.write_file(
                &self.config.peer_key_path(&name, ordinal),
                &format!("{}\n", private_key),
                0o600,
            )?;
            self.shell.write_file(
                &self.config.peer_pub_path(&name, ordinal),
                &format!("{}\n", public_key),
                0o644,
            )?;
            peers.push(Peer {
                ordinal,
                address: Some(address),
                public_key: Some(public_key),
                config: content,
                file,
            });
        }
        if !peers.is_empty() {
            self.warn(
                detail,
                format!(
                    "synthesized {} client configs from the live interface with new private keys",
                    peers.len()
                ),
            );
        }
        Ok(peers)
    }
}

fn key_for_address(server: &WgConfig, addr: Ipv4Addr) -> Option<String> {
    server
        .peers
        .iter()
        .find(|p| p.allowed_ips().iter().any(|n| n.prefix_len() == 32 && n.addr() == addr))
        .and_then(|p| p.public_key())
        .map(str::to_string)
}

fn activation_status(name: &str, evidence: &[DiscoveryEvidence]) -> ActivationStatus {
    let names = |source| {
        evidence::find(evidence, source)
            .map(evidence::instance_names)
            .unwrap_or_default()
    };
    if names(EvidenceSource::LiveStatus).contains(name)
        || names(EvidenceSource::InterfaceListing).contains(name)
    {
        return ActivationStatus::Active;
    }
    let live_probe_ran = evidence::find(evidence, EvidenceSource::LiveStatus)
        .map(|e| e.ok)
        .unwrap_or(false);
    let service_down = evidence::find(evidence, EvidenceSource::ServiceStatus)
        .map(|e| {
            e.raw.lines().any(|l| {
                l.contains(&format!("wg-quick@{}.service", name))
                    && (l.contains(" inactive ") || l.contains(" failed "))
            })
        })
        .unwrap_or(false);
    if live_probe_ran || service_down {
        ActivationStatus::Inactive
    } else {
        ActivationStatus::Unknown
    }
}

fn config_from_primary_file(r: &Reconciler<'_>, name: &str) -> Result<Option<String>> {
    let text = remote::read_file(r.shell, &r.config.server_config_path(name))?;
    Ok(text.filter(|t| WgConfig::parse(t).is_some()))
}

fn config_from_live_interface(r: &Reconciler<'_>, name: &str) -> Result<Option<String>> {
    let out = r
        .shell
        .exec(&format!("wg showconf {} 2>/dev/null", quote(name)))?;
    let Some(mut parsed) = out.text().and_then(WgConfig::parse) else {
        return Ok(None);
    };
    // showconf omits the wg-quick only fields
    if parsed.interface.address().is_none() {
        if let Some(net) = endpoint::interface_network(r.shell, name) {
            parsed.interface.set("Address", net.to_string());
        }
    }
    Ok(Some(parsed.render()))
}

fn config_from_live_attributes(r: &Reconciler<'_>, name: &str) -> Result<Option<String>> {
    let port = r
        .wg_show(name, "listen-port")?
        .and_then(|p| p.parse::<u16>().ok());
    let address = endpoint::interface_network(r.shell, name);
    if port.is_none() && address.is_none() {
        return Ok(None);
    }
    let private_key = match r.wg_show(name, "private-key")?.filter(|k| is_valid_key(k)) {
        Some(key) => key,
        None => {
            remote::generate_keypair(
                r.shell,
                &r.config.server_key_path(name),
                &r.config.server_pub_path(name),
            )?
            .0
        }
    };

    let mut interface = Section::new();
    if let Some(address) = address {
        interface.push("Address", address.to_string());
    }
    interface.push(
        "ListenPort",
        port.unwrap_or(r.config.network.default_listen_port).to_string(),
    );
    interface.push("PrivateKey", private_key);
    let peers = r
        .live_peers(name)?
        .into_iter()
        .map(|(key, nets)| {
            let allowed: Vec<String> = nets.iter().map(|n| n.to_string()).collect();
            Section::new()
                .with("PublicKey", key)
                .with("AllowedIPs", allowed.join(", "))
        })
        .collect();
    Ok(Some(WgConfig { interface, peers }.render()))
}

fn config_from_peer_configs(r: &Reconciler<'_>, name: &str) -> Result<Option<String>> {
    let pattern = format!("{}-peer*-client.conf", name);
    let mut clients: Vec<(u32, WgConfig)> = Vec::new();
    for path in remote::list_files(r.shell, &r.config.paths.deploy_dir, &pattern)? {
        let Some((_, ordinal)) = evidence::parse_peer_file(&path) else {
            continue;
        };
        if let Some(parsed) = remote::read_file(r.shell, &path)?.as_deref().and_then(WgConfig::parse) {
            clients.push((ordinal, parsed));
        }
    }
    clients.sort_by_key(|(ordinal, _)| *ordinal);

    let Some((server_address, listen_port)) = clients.iter().find_map(|(_, client)| {
        let net = client.interface.address()?;
        let server = Ipv4Net::new(Ipv4Addr::from(u32::from(net.network()) + 1), net.prefix_len()).ok()?;
        let port = client.peers.first().and_then(|p| p.endpoint()).map(|(_, port)| port);
        Some((server, port))
    }) else {
        return Ok(None);
    };

    let private_key = match r.read_key(&r.config.server_key_path(name))? {
        Some(key) => key,
        None => {
            remote::generate_keypair(
                r.shell,
                &r.config.server_key_path(name),
                &r.config.server_pub_path(name),
            )?
            .0
        }
    };

    let mut peers = Vec::new();
    for (ordinal, client) in &clients {
        let Some(addr) = client.interface.address().map(|n| n.addr()) else {
            continue;
        };
        if let Some(key) = r.read_key(&r.config.peer_pub_path(name, *ordinal))? {
            peers.push(synth::server_peer(&key, addr));
        }
    }

    let interface = Section::new()
        .with("Address", server_address.to_string())
        .with(
            "ListenPort",
            listen_port
                .unwrap_or(r.config.network.default_listen_port)
                .to_string(),
        )
        .with("PrivateKey", private_key);
    Ok(Some(WgConfig { interface, peers }.render()))
}

fn seq_range(text: &str) -> Option<PortRange> {
    let caps = seq_re().captures(text)?;
    let start: u16 = caps[1].parse().ok()?;
    let end: u16 = caps[2].parse().ok()?;
    (start <= end).then(|| PortRange::new(start, end))
}

fn range_from_post_up(_r: &Reconciler<'_>, input: &RangeInput<'_>) -> Result<Option<PortRange>> {
    Ok(input
        .server
        .and_then(|s| s.interface.get("PostUp"))
        .and_then(seq_range))
}

fn range_from_firewall(r: &Reconciler<'_>, input: &RangeInput<'_>) -> Result<Option<PortRange>> {
    let Some(listen_port) = input.listen_port else {
        return Ok(None);
    };
    let out = r.shell.exec("iptables -t nat -S PREROUTING 2>/dev/null")?;
    if !out.success() {
        return Ok(None);
    }
    let mut found: Option<PortRange> = None;
    for line in out.stdout.lines() {
        let to_port = to_destination_re()
            .captures(line)
            .and_then(|c| c[1].parse::<u16>().ok());
        if to_port != Some(listen_port) {
            continue;
        }
        let Some(caps) = dport_re().captures(line) else {
            continue;
        };
        let Ok(start) = caps[1].parse::<u16>() else {
            continue;
        };
        let end = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(start);
        // a bare DNAT of the listen port onto itself is not a forwarded range
        if start == listen_port && end == listen_port {
            continue;
        }
        found = Some(match found {
            Some(prev) => PortRange::new(prev.start.min(start), prev.end.max(end)),
            None => PortRange::new(start, end),
        });
    }
    Ok(found)
}

fn range_from_service_log(r: &Reconciler<'_>, input: &RangeInput<'_>) -> Result<Option<PortRange>> {
    let out = r.shell.exec(&format!(
        "journalctl -u wg-quick@{} --no-pager 2>/dev/null | grep 'seq ' | tail -n 1",
        quote(input.name)
    ))?;
    Ok(out.text().and_then(seq_range))
}

fn range_from_name(r: &Reconciler<'_>, input: &RangeInput<'_>) -> Result<Option<PortRange>> {
    Ok(instance_ordinal(input.name).and_then(|n| allocate::arithmetic_range(n, &r.config.network)))
}

fn range_from_listen_port(_r: &Reconciler<'_>, input: &RangeInput<'_>) -> Result<Option<PortRange>> {
    Ok(input.listen_port.map(PortRange::single))
}

/// Instances on the host, cheapest view
pub fn list_instances(shell: &dyn RemoteShell, config: &EngineConfig) -> Vec<InstanceSummary> {
    Reconciler::new(shell, config).list_instances()
}

pub fn get_instance_details(
    shell: &dyn RemoteShell,
    config: &EngineConfig,
    name: &str,
) -> Result<InstanceDetail> {
    Reconciler::new(shell, config).instance_details(name)
}
