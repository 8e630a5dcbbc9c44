//! End-to-end behaviour against a scripted host

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use wg_remote_core::allocate::{self, Claim};
use wg_remote_core::mock::ScriptedShell;
use wg_remote_core::synth;
use wg_remote_core::{
    get_instance_details, list_instances, provision, CommandOutput, EngineConfig, ErrorKind,
    PeerManager, PortRange, ProvisionState, Reconciler, WgConfig,
};

const DEPLOY: &str = "/root/VPS配置WG";

fn key(n: u8) -> String {
    ScriptedShell::fake_key(n)
}

fn wg0_server() -> String {
    format!(
        "[Interface]\n\
         Address = 10.0.1.1/24\n\
         ListenPort = 52835\n\
         PrivateKey = {}\n\
         PostUp = iptables -t nat -A POSTROUTING -s 10.0.1.0/24 -o eth0 -j SNAT --to-source 203.0.113.5; for port in $(seq 55835 56834); do iptables -t nat -A PREROUTING -d 203.0.113.5 -p udp --dport $port -j DNAT --to-destination 203.0.113.5:52835; done\n\
         \n\
         [Peer]\n\
         PublicKey = {}\n\
         AllowedIPs = 10.0.1.2/32\n",
        key(200),
        key(210)
    )
}

/// One instance `wg0` with its server at .1 and one peer at .2
fn host_with_wg0() -> ScriptedShell {
    let shell = ScriptedShell::new("vps-1");
    shell.with_file("/etc/wireguard/wg0.conf", &wg0_server());
    shell.with_file(&format!("{}/wg0-server.pub", DEPLOY), &format!("{}\n", key(201)));
    shell.with_file(
        &format!("{}/wg0-peer1-client.conf", DEPLOY),
        &format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.0.1.2/24\nDNS = 1.1.1.1\n\n[Peer]\nPublicKey = {}\nEndpoint = 203.0.113.5:52835\nAllowedIPs = 0.0.0.0/0, ::/0\nPersistentKeepalive = 25\n",
            key(211),
            key(201)
        ),
    );
    shell.with_file(&format!("{}/wg0-peer1.pub", DEPLOY), &format!("{}\n", key(210)));
    shell.on("systemctl restart", CommandOutput::ok(""));
    shell
}

#[test]
fn test_host_without_wireguard_lists_nothing() {
    let shell = ScriptedShell::new("bare");
    let instances = list_instances(&shell, &EngineConfig::default());
    assert!(instances.is_empty());
}

#[test]
fn test_add_peer_takes_second_slot() {
    let shell = host_with_wg0();
    let manager = PeerManager::new(EngineConfig::default());
    let peer = manager.add_peer(&shell, "wg0").unwrap();
    assert_eq!(peer.ordinal, 2);
    assert_eq!(peer.address, Ipv4Addr::new(10, 0, 1, 3));

    let detail = get_instance_details(&shell, manager.config(), "wg0").unwrap();
    let ordinals: Vec<u32> = detail.peers.iter().map(|p| p.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2]);
}

#[test]
fn test_second_instance_does_not_overlap() {
    let shell = host_with_wg0();
    let config = EngineConfig::default();
    let wg0 = get_instance_details(&shell, &config, "wg0").unwrap();
    let mapping = wg0.port_mapping.unwrap();
    assert_eq!(mapping.range, PortRange::new(55835, 56834));

    let next = allocate::next_instance_allocation(&[Claim::from(&wg0)], &config.network).unwrap();
    assert_eq!(next.name, "wg1");
    assert_eq!(next.listen_port, 52845);
    assert_eq!(next.forward_range, PortRange::new(56835, 57834));
    assert!(!next.forward_range.overlaps(&mapping.range));
    assert!(!mapping.range.contains(next.listen_port));
}

#[test]
fn test_remove_missing_peer() {
    let shell = host_with_wg0();
    let manager = PeerManager::new(EngineConfig::default());
    let err = manager.remove_peer(&shell, "wg0", 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerNotFound);
    assert_eq!(shell.file("/etc/wireguard/wg0.conf").unwrap(), wg0_server());
}

#[test]
fn test_next_free_address_is_read_only() {
    let shell = host_with_wg0();
    let config = EngineConfig::default();
    let detail = get_instance_details(&shell, &config, "wg0").unwrap();
    let server = WgConfig::parse(detail.config.as_deref().unwrap()).unwrap();
    let mut taken = server.claimed_networks();
    taken.push(Ipv4Net::from(detail.address.unwrap().addr()));

    let first = allocate::next_free_address(detail.subnet().unwrap(), &taken).unwrap();
    let second = allocate::next_free_address(detail.subnet().unwrap(), &taken).unwrap();
    assert_eq!(first, second);
    assert!(!server.claimed_networks().iter().any(|n| n.contains(&first)));
}

#[test]
fn test_synthesized_server_config_round_trips() {
    let config = EngineConfig::default();
    let allocation = allocate::instance_allocation(3, &config.network).unwrap();
    let peers = vec![
        synth::server_peer(&key(2), Ipv4Addr::new(10, 0, 4, 2)),
        synth::server_peer(&key(3), Ipv4Addr::new(10, 0, 4, 3)),
    ];
    let rendered = synth::server_config(
        &allocation,
        &key(1),
        Ipv4Addr::new(198, 51, 100, 7),
        "ens3",
        peers,
    )
    .render();

    let shell = ScriptedShell::new("vps-2");
    shell.with_file("/etc/wireguard/wg3.conf", &rendered);
    let detail = get_instance_details(&shell, &config, "wg3").unwrap();

    assert_eq!(detail.address, Some(allocation.server_address));
    assert_eq!(detail.listen_port, Some(allocation.listen_port));
    assert_eq!(detail.port_mapping.unwrap().range, allocation.forward_range);
    assert_eq!(detail.public_address, Some(Ipv4Addr::new(198, 51, 100, 7)));
    let parsed = WgConfig::parse(detail.config.as_deref().unwrap()).unwrap();
    let keys: Vec<&str> = parsed.peers.iter().filter_map(|p| p.public_key()).collect();
    assert_eq!(keys, vec![key(2).as_str(), key(3).as_str()]);
}

#[test]
fn test_reconcile_is_idempotent() {
    let shell = host_with_wg0();
    let config = EngineConfig::default();
    let reconciler = Reconciler::new(&shell, &config);
    let first = reconciler.snapshot().unwrap();
    let second = reconciler.snapshot().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].peers.len(), 1);
    assert!(first[0].warnings.is_empty());
}

#[test]
fn test_provision_adds_instance_for_unserved_address() {
    let shell = Arc::new(host_with_wg0());
    shell.on("command -v wg", CommandOutput::ok(""));
    shell.on(
        "ip -4 route show default",
        CommandOutput::ok("default via 203.0.113.1 dev eth0\n"),
    );
    shell.on(
        "ip -4 -o addr show dev eth0",
        CommandOutput::ok(
            "2: eth0    inet 203.0.113.5/24 scope global eth0\n2: eth0    inet 203.0.113.6/24 scope global secondary eth0\n",
        ),
    );
    shell.on("curl", CommandOutput::ok("203.0.113.5\n"));
    shell.on("nohup bash", CommandOutput::ok("777\n"));
    shell.on("tail -n", CommandOutput::ok(""));
    shell.on("kill -0", CommandOutput::ok("alive\n"));
    shell.on_effect(
        "kill -0",
        &format!("{}/wg1-peer1-client.conf", DEPLOY),
        "[Interface]\nAddress = 10.0.2.2/24\n",
    );

    let mut config = EngineConfig::default();
    config.provision.poll_interval_ms = 1;
    let result = provision(shell.clone(), config.clone()).unwrap().wait();

    assert_eq!(result.state, ProvisionState::Succeeded);
    assert_eq!(result.instances, vec!["wg1"]);
    let names: Vec<&str> = result.client_configs.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["wg0-peer1-client.conf", "wg1-peer1-client.conf"]);

    let script = shell.file(&config.paths.script_path).unwrap();
    assert!(script.contains("systemctl restart wg-quick@wg1"));
    assert!(script.contains("--to-source 203.0.113.6"));
    assert!(script.contains("ListenPort = 52845"));
    assert!(!script.contains("wg-quick@wg0"));
}
