//! Peer add and remove on an existing instance
//!
//! Neither operation is transactional. Every mutating step reports itself
//! through [`LifecycleStep`] so a caller knows how far the host got.

use crate::endpoint::{self, EndpointQuery};
use crate::remote;
use crate::session::{quote, RemoteShell};
use crate::synth::{self, ClientParams};
use crate::wg_config::{is_valid_key, WgConfig};
use crate::{
    allocate, validate_instance_name, Ack, EngineConfig, Error, LifecycleStep, PeerResult, Result,
};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::sync::Mutex;

/// Adds and removes peers, remembering the highest ordinal handed out per
/// instance so a removed ordinal is not reused while this manager lives
#[derive(Default)]
pub struct PeerManager {
    config: EngineConfig,
    high_water: Mutex<HashMap<(String, String), u32>>,
}

struct ServerState {
    text: String,
    parsed: WgConfig,
    address: Ipv4Net,
}

impl PeerManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            high_water: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ledger_key(shell: &dyn RemoteShell, instance: &str) -> (String, String) {
        (shell.host_id().to_string(), instance.to_string())
    }

    fn high_water(&self, shell: &dyn RemoteShell, instance: &str) -> Option<u32> {
        let ledger = self.high_water.lock().unwrap_or_else(|e| e.into_inner());
        ledger.get(&Self::ledger_key(shell, instance)).copied()
    }

    fn record(&self, shell: &dyn RemoteShell, instance: &str, ordinal: u32) {
        let mut ledger = self.high_water.lock().unwrap_or_else(|e| e.into_inner());
        let entry = ledger.entry(Self::ledger_key(shell, instance)).or_insert(0);
        *entry = (*entry).max(ordinal);
    }

    fn read_server(&self, shell: &dyn RemoteShell, instance: &str) -> Result<ServerState> {
        validate_instance_name(instance).map_err(Error::validation)?;
        let path = self.config.server_config_path(instance);
        let text = remote::read_file(shell, &path)
            .map_err(|e| Error::lifecycle(instance, LifecycleStep::ReadServerConfig, e.to_string()))?
            .ok_or_else(|| Error::InstanceNotFound(instance.to_string()))?;
        let parsed = WgConfig::parse(&text).ok_or_else(|| {
            Error::lifecycle(
                instance,
                LifecycleStep::ReadServerConfig,
                format!("{} has no [Interface] section", path),
            )
        })?;
        let address = parsed.interface.address().ok_or_else(|| {
            Error::lifecycle(
                instance,
                LifecycleStep::ReadServerConfig,
                format!("{} has no IPv4 Address", path),
            )
        })?;
        Ok(ServerState {
            text,
            parsed,
            address,
        })
    }

    /// Ordinals that have a client config, key or public key file
    fn existing_ordinals(&self, shell: &dyn RemoteShell, instance: &str) -> Result<Vec<u32>> {
        let mut ordinals = Vec::new();
        for path in remote::list_files(shell, &self.config.paths.deploy_dir, &format!("{}-peer*", instance))? {
            let name = remote::file_name(&path);
            let Some(rest) = name.strip_prefix(&format!("{}-peer", instance)) else {
                continue;
            };
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            let suffix = &rest[digits.len()..];
            if !matches!(suffix, ".key" | ".pub" | "-client.conf") {
                continue;
            }
            if let Ok(n) = digits.parse::<u32>() {
                if !ordinals.contains(&n) {
                    ordinals.push(n);
                }
            }
        }
        Ok(ordinals)
    }

    /// Networks already assigned to the server, its peers and existing clients
    fn taken_addresses(
        &self,
        shell: &dyn RemoteShell,
        instance: &str,
        server: &ServerState,
    ) -> Result<Vec<Ipv4Net>> {
        let mut taken = vec![Ipv4Net::from(server.address.addr())];
        taken.extend(server.parsed.claimed_networks());
        let pattern = format!("{}-peer*-client.conf", instance);
        for path in remote::list_files(shell, &self.config.paths.deploy_dir, &pattern)? {
            if let Some(addr) = remote::read_file(shell, &path)?
                .as_deref()
                .and_then(WgConfig::parse)
                .and_then(|c| c.interface.address())
            {
                taken.push(Ipv4Net::from(addr.addr()));
            }
        }
        Ok(taken)
    }

    fn server_public_key(&self, shell: &dyn RemoteShell, instance: &str) -> Result<Option<String>> {
        let from_file = remote::read_file(shell, &self.config.server_pub_path(instance))?
            .map(|k| k.trim().to_string());
        if let Some(key) = from_file.filter(|k| is_valid_key(k)) {
            return Ok(Some(key));
        }
        let live = shell.exec(&format!("wg show {} public-key 2>/dev/null", quote(instance)))?;
        if let Some(key) = live.text().filter(|k| is_valid_key(k)) {
            return Ok(Some(key.to_string()));
        }
        let derived = shell.exec(&format!(
            "sed -n 's/^PrivateKey *= *//p' {} | head -n 1 | wg pubkey 2>/dev/null",
            quote(&self.config.server_config_path(instance))
        ))?;
        Ok(derived.text().filter(|k| is_valid_key(k)).map(str::to_string))
    }

    /// Add one peer to `instance` and return its client config
    pub fn add_peer(&self, shell: &dyn RemoteShell, instance: &str) -> Result<PeerResult> {
        let server = self.read_server(shell, instance)?;
        let existing = self.existing_ordinals(shell, instance)?;
        let ordinal = allocate::next_peer_ordinal(&existing, self.high_water(shell, instance));
        let taken = self.taken_addresses(shell, instance, &server)?;
        let address = allocate::next_free_address(server.address.trunc(), &taken)?;

        let server_public = self.server_public_key(shell, instance)?.ok_or_else(|| {
            Error::lifecycle(
                instance,
                LifecycleStep::ReadServerConfig,
                "server public key is unavailable",
            )
        })?;
        let listen_port = server
            .parsed
            .interface
            .listen_port()
            .unwrap_or(self.config.network.default_listen_port);
        let query = EndpointQuery {
            instance,
            server: Some(&server.parsed),
            subnet: Some(server.address.trunc()),
            listen_port: Some(listen_port),
            config: &self.config,
        };
        // resolved before anything is written so a failure leaves the host as it was
        let endpoint = endpoint::resolve(shell, &query)?;

        let (private_key, public_key) = remote::generate_keypair(
            shell,
            &self.config.peer_key_path(instance, ordinal),
            &self.config.peer_pub_path(instance, ordinal),
        )
        .map_err(|e| Error::lifecycle(instance, LifecycleStep::GenerateKeys, e.to_string()))?;
        self.record(shell, instance, ordinal);

        let client_address = Ipv4Net::new(address, server.address.prefix_len())
            .map_err(|e| Error::lifecycle(instance, LifecycleStep::WriteClientConfig, e.to_string()))?;
        let config = synth::client_config(
            &ClientParams {
                private_key: &private_key,
                address: client_address,
                server_public_key: &server_public,
                endpoint,
                endpoint_port: listen_port,
            },
            &self.config.network,
        );
        let file = self.config.client_config_path(instance, ordinal);
        shell
            .write_file(&file, &config, 0o600)
            .map_err(|e| Error::lifecycle(instance, LifecycleStep::WriteClientConfig, e.to_string()))?;

        let updated = synth::append_peer(&server.text, &synth::server_peer(&public_key, address));
        shell
            .write_file(&self.config.server_config_path(instance), &updated, 0o600)
            .map_err(|e| Error::lifecycle(instance, LifecycleStep::AppendServerPeer, e.to_string()))?;

        remote::restart_service(shell, instance)
            .map_err(|e| Error::lifecycle(instance, LifecycleStep::RestartService, e.to_string()))?;

        log::info!(
            "[{}] added peer {} ({}) to {}",
            shell.host_id(),
            ordinal,
            address,
            instance
        );
        Ok(PeerResult {
            instance: instance.to_string(),
            ordinal,
            address,
            public_key,
            config,
            file,
        })
    }

    /// Public key of an existing peer, from its `.pub` file or its private
    /// key file. `None` when neither file holds a key.
    fn peer_public_key(
        &self,
        shell: &dyn RemoteShell,
        instance: &str,
        ordinal: u32,
    ) -> Result<Option<String>> {
        let from_pub = remote::read_file(shell, &self.config.peer_pub_path(instance, ordinal))?
            .map(|k| k.trim().to_string());
        if let Some(key) = from_pub.filter(|k| is_valid_key(k)) {
            return Ok(Some(key));
        }
        let key_path = self.config.peer_key_path(instance, ordinal);
        if !remote::file_exists(shell, &key_path)? {
            return Ok(None);
        }
        let out = shell.exec(&format!("wg pubkey < {} 2>/dev/null", quote(&key_path)))?;
        Ok(out.text().filter(|k| is_valid_key(k)).map(str::to_string))
    }

    /// Remove peer `ordinal` from `instance`
    pub fn remove_peer(&self, shell: &dyn RemoteShell, instance: &str, ordinal: u32) -> Result<Ack> {
        let server = self.read_server(shell, instance)?;
        let not_found = || Error::PeerNotFound {
            instance: instance.to_string(),
            ordinal,
        };
        let client_path = self.config.client_config_path(instance, ordinal);
        if !remote::file_exists(shell, &client_path)? {
            return Err(not_found());
        }
        let public_key = self
            .peer_public_key(shell, instance, ordinal)?
            .ok_or_else(not_found)?;

        let server_path = self.config.server_config_path(instance);
        match synth::remove_peer(&server.text, &public_key) {
            Some(updated) => shell.write_file(&server_path, &updated, 0o600).map_err(|e| {
                Error::lifecycle(instance, LifecycleStep::RewriteServerConfig, e.to_string())
            })?,
            None => log::warn!(
                "[{}] {} has no [Peer] stanza for peer {}; removing its files only",
                shell.host_id(),
                instance,
                ordinal
            ),
        }

        remote::remove_files(
            shell,
            &[
                self.config.peer_key_path(instance, ordinal),
                self.config.peer_pub_path(instance, ordinal),
                client_path,
            ],
        )
        .map_err(|e| Error::lifecycle(instance, LifecycleStep::DeletePeerFiles, e.to_string()))?;
        self.record(shell, instance, ordinal);

        remote::restart_service(shell, instance)
            .map_err(|e| Error::lifecycle(instance, LifecycleStep::RestartService, e.to_string()))?;

        log::info!("[{}] removed peer {} from {}", shell.host_id(), ordinal, instance);
        Ok(Ack {
            message: format!("removed peer {} from {}", ordinal, instance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedShell;
    use crate::session::CommandOutput;
    use crate::reconcile::get_instance_details;
    use crate::ErrorKind;
    use std::net::Ipv4Addr;

    const DEPLOY: &str = "/root/VPS配置WG";

    fn key(n: u8) -> String {
        ScriptedShell::fake_key(n)
    }

    fn server_text() -> String {
        format!(
            "[Interface]\nAddress = 10.0.1.1/24\nListenPort = 52835\nPrivateKey = {}\nPostUp = iptables -t nat -A POSTROUTING -s 10.0.1.0/24 -o eth0 -j SNAT --to-source 203.0.113.5\n\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.1.2/32\n",
            key(200),
            key(210)
        )
    }

    fn host_with_one_peer() -> ScriptedShell {
        let shell = ScriptedShell::new("vps-1");
        shell.with_file("/etc/wireguard/wg0.conf", &server_text());
        shell.with_file(&format!("{}/wg0-server.pub", DEPLOY), &format!("{}\n", key(201)));
        shell.with_file(
            &format!("{}/wg0-peer1-client.conf", DEPLOY),
            "[Interface]\nPrivateKey = x\nAddress = 10.0.1.2/24\n",
        );
        shell.with_file(&format!("{}/wg0-peer1.pub", DEPLOY), &format!("{}\n", key(210)));
        shell.on("systemctl restart", CommandOutput::ok(""));
        shell
    }

    #[test]
    fn test_add_peer_allocates_next_slot() {
        let shell = host_with_one_peer();
        let manager = PeerManager::new(EngineConfig::default());
        let peer = manager.add_peer(&shell, "wg0").unwrap();

        assert_eq!(peer.ordinal, 2);
        assert_eq!(peer.address, Ipv4Addr::new(10, 0, 1, 3));
        assert_eq!(peer.file, format!("{}/wg0-peer2-client.conf", DEPLOY));
        assert!(peer.config.contains("Endpoint = 203.0.113.5:52835"));
        assert!(peer.config.contains(&format!("PublicKey = {}", key(201))));

        let server = WgConfig::parse(&shell.file("/etc/wireguard/wg0.conf").unwrap()).unwrap();
        assert_eq!(server.peers.len(), 2);
        assert!(server.peer_by_key(&peer.public_key).is_some());
        assert!(shell.ran("systemctl restart wg-quick@wg0"));
    }

    #[test]
    fn test_add_peer_requires_primary_config() {
        let shell = ScriptedShell::new("vps-1");
        let manager = PeerManager::new(EngineConfig::default());
        let err = manager.add_peer(&shell, "wg0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InstanceNotFound);
        assert!(shell.files().is_empty());
    }

    #[test]
    fn test_add_peer_without_endpoint_changes_nothing() {
        let shell = ScriptedShell::new("vps-1");
        shell.with_file(
            "/etc/wireguard/wg0.conf",
            &format!("[Interface]\nAddress = 10.0.1.1/24\nListenPort = 52835\nPrivateKey = {}\n", key(200)),
        );
        shell.with_file(&format!("{}/wg0-server.pub", DEPLOY), &format!("{}\n", key(201)));
        let before = shell.files();
        let manager = PeerManager::new(EngineConfig::default());
        let err = manager.add_peer(&shell, "wg0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPublicAddress);
        assert_eq!(shell.files(), before);
    }

    #[test]
    fn test_restart_failure_names_step() {
        let shell = host_with_one_peer();
        shell.on("systemctl restart", CommandOutput::failed(1, "Job failed"));
        let manager = PeerManager::new(EngineConfig::default());
        match manager.add_peer(&shell, "wg0").unwrap_err() {
            Error::Lifecycle { step, .. } => assert_eq!(step, LifecycleStep::RestartService),
            other => panic!("unexpected error {other:?}"),
        }
        // mutation is not rolled back
        assert!(shell.file(&format!("{}/wg0-peer2-client.conf", DEPLOY)).is_some());
    }

    #[test]
    fn test_remove_peer_deletes_stanza_and_files() {
        let shell = host_with_one_peer();
        let manager = PeerManager::new(EngineConfig::default());
        let ack = manager.remove_peer(&shell, "wg0", 1).unwrap();
        assert!(ack.message.contains("peer 1"));

        let server = WgConfig::parse(&shell.file("/etc/wireguard/wg0.conf").unwrap()).unwrap();
        assert!(server.peers.is_empty());
        assert!(shell.file(&format!("{}/wg0-peer1-client.conf", DEPLOY)).is_none());
        assert!(shell.file(&format!("{}/wg0-peer1.pub", DEPLOY)).is_none());
    }

    #[test]
    fn test_remove_missing_peer_leaves_server_unchanged() {
        let shell = host_with_one_peer();
        let manager = PeerManager::new(EngineConfig::default());
        let err = manager.remove_peer(&shell, "wg0", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);
        assert_eq!(shell.file("/etc/wireguard/wg0.conf").unwrap(), server_text());
        assert!(!shell.ran("systemctl restart"));
    }

    #[test]
    fn test_removed_ordinal_not_reused() {
        let shell = host_with_one_peer();
        let manager = PeerManager::new(EngineConfig::default());
        let second = manager.add_peer(&shell, "wg0").unwrap();
        assert_eq!(second.ordinal, 2);
        manager.remove_peer(&shell, "wg0", 2).unwrap();
        let third = manager.add_peer(&shell, "wg0").unwrap();
        assert_eq!(third.ordinal, 3);
        let detail = get_instance_details(&shell, manager.config(), "wg0").unwrap();
        let ordinals: Vec<u32> = detail.peers.iter().map(|p| p.ordinal).collect();
        assert_eq!(ordinals, vec![1, 3]);
    }

    #[test]
    fn test_add_peer_skips_range_claimed_by_wide_peer() {
        let shell = ScriptedShell::new("vps-1");
        shell.with_file(
            "/etc/wireguard/wg0.conf",
            &format!(
                "[Interface]\nAddress = 10.0.1.1/24\nListenPort = 52835\nPrivateKey = {}\nPostUp = iptables -t nat -A POSTROUTING -s 10.0.1.0/24 -o eth0 -j SNAT --to-source 203.0.113.5\n\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.1.2/31\n",
                key(200),
                key(210)
            ),
        );
        shell.with_file(&format!("{}/wg0-server.pub", DEPLOY), &format!("{}\n", key(201)));
        shell.on("systemctl restart", CommandOutput::ok(""));
        let manager = PeerManager::new(EngineConfig::default());
        let peer = manager.add_peer(&shell, "wg0").unwrap();
        assert_eq!(peer.address, Ipv4Addr::new(10, 0, 1, 4));
    }

    #[test]
    fn test_remove_peer_without_key_files_is_not_found() {
        let shell = host_with_one_peer();
        shell.exec(&format!("rm -f {}/wg0-peer1.pub", DEPLOY)).unwrap();
        let manager = PeerManager::new(EngineConfig::default());
        let err = manager.remove_peer(&shell, "wg0", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);
        assert_eq!(shell.file("/etc/wireguard/wg0.conf").unwrap(), server_text());
        assert!(shell.file(&format!("{}/wg0-peer1-client.conf", DEPLOY)).is_some());
    }

    #[test]
    fn test_remove_peer_derives_key_from_private_key_file() {
        let shell = host_with_one_peer();
        shell.exec(&format!("rm -f {}/wg0-peer1.pub", DEPLOY)).unwrap();
        shell.with_file(&format!("{}/wg0-peer1.key", DEPLOY), &format!("{}\n", key(209)));
        shell.on("wg pubkey <", CommandOutput::ok(format!("{}\n", key(210))));
        let manager = PeerManager::new(EngineConfig::default());
        manager.remove_peer(&shell, "wg0", 1).unwrap();
        let server = WgConfig::parse(&shell.file("/etc/wireguard/wg0.conf").unwrap()).unwrap();
        assert!(server.peers.is_empty());
        assert!(shell.file(&format!("{}/wg0-peer1.key", DEPLOY)).is_none());
    }
}
