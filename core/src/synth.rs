//! Rendering of server and client configurations
//!
//! Everything here is pure text generation so the output can be compared
//! byte for byte against what `wg-quick` reads back.

use crate::config::NetworkSection;
use crate::wg_config::{Section, WgConfig};
use crate::InstanceAllocation;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Routes all client traffic through the tunnel
pub const CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0, ::/0";

/// Inputs for one client configuration
#[derive(Debug, Clone)]
pub struct ClientParams<'a> {
    pub private_key: &'a str,
    /// Client address with the instance prefix, e.g. `10.0.1.2/24`
    pub address: Ipv4Net,
    pub server_public_key: &'a str,
    pub endpoint: Ipv4Addr,
    pub endpoint_port: u16,
}

pub fn client_config(params: &ClientParams<'_>, network: &NetworkSection) -> String {
    let config = WgConfig {
        interface: Section::new()
            .with("PrivateKey", params.private_key)
            .with("Address", params.address.to_string())
            .with("DNS", network.dns.as_str()),
        peers: vec![Section::new()
            .with("PublicKey", params.server_public_key)
            .with(
                "Endpoint",
                format!("{}:{}", params.endpoint, params.endpoint_port),
            )
            .with("AllowedIPs", CLIENT_ALLOWED_IPS)
            .with(
                "PersistentKeepalive",
                network.persistent_keepalive.to_string(),
            )],
    };
    config.render()
}

/// Server side `[Peer]` stanza admitting exactly one address
pub fn server_peer(public_key: &str, address: Ipv4Addr) -> Section {
    Section::new()
        .with("PublicKey", public_key)
        .with("AllowedIPs", format!("{}/32", address))
}

/// Append a peer stanza to existing server config text, leaving the rest untouched
pub fn append_peer(server_text: &str, peer: &Section) -> String {
    let mut out = server_text.trim_end().to_string();
    out.push_str("\n\n");
    out.push_str(&peer.render("[Peer]"));
    out
}

/// Remove the `[Peer]` section whose `PublicKey` is `public_key`
///
/// Returns `None` if no such section exists. Sections are joined by one
/// blank line in the result.
pub fn remove_peer(server_text: &str, public_key: &str) -> Option<String> {
    let mut blocks: Vec<Vec<&str>> = vec![Vec::new()];
    for line in server_text.lines() {
        if line.trim_start().starts_with('[') {
            blocks.push(Vec::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    let before = blocks.len();
    blocks.retain(|block| !(is_peer_block(block) && block_key(block) == Some(public_key)));
    if blocks.len() == before {
        return None;
    }

    let kept: Vec<String> = blocks
        .iter()
        .map(|b| b.join("\n").trim().to_string())
        .filter(|b| !b.is_empty())
        .collect();
    let mut out = kept.join("\n\n");
    out.push('\n');
    Some(out)
}

fn is_peer_block(block: &[&str]) -> bool {
    block
        .first()
        .map(|l| l.trim().eq_ignore_ascii_case("[peer]"))
        .unwrap_or(false)
}

fn block_key<'a>(block: &[&'a str]) -> Option<&'a str> {
    block.iter().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("PublicKey")
            .then_some(value.trim())
    })
}

/// Firewall hooks for one instance
///
/// Accepts forwarding on the interface, source-NATs the subnet to
/// `public_ip` out of `external_iface`, and DNATs every port of the forwarded
/// range on `public_ip` to the listen port.
pub fn firewall_hooks(
    allocation: &InstanceAllocation,
    public_ip: Ipv4Addr,
    external_iface: &str,
) -> (String, String) {
    let hook = |op: char| {
        format!(
            "iptables -{op} FORWARD -i %i -j ACCEPT; \
             iptables -{op} FORWARD -o %i -j ACCEPT; \
             iptables -t nat -{op} POSTROUTING -s {subnet} -o {ext} -j SNAT --to-source {ip}; \
             for port in $(seq {start} {end}); do iptables -t nat -{op} PREROUTING -d {ip} -p udp --dport $port -j DNAT --to-destination {ip}:{listen}; done",
            op = op,
            subnet = allocation.subnet(),
            ext = external_iface,
            ip = public_ip,
            start = allocation.forward_range.start,
            end = allocation.forward_range.end,
            listen = allocation.listen_port,
        )
    };
    (hook('A'), hook('D'))
}

/// Full server configuration for a new instance
pub fn server_config(
    allocation: &InstanceAllocation,
    private_key: &str,
    public_ip: Ipv4Addr,
    external_iface: &str,
    peers: Vec<Section>,
) -> WgConfig {
    let (post_up, post_down) = firewall_hooks(allocation, public_ip, external_iface);
    WgConfig {
        interface: Section::new()
            .with("Address", allocation.server_address.to_string())
            .with("ListenPort", allocation.listen_port.to_string())
            .with("PrivateKey", private_key)
            .with("PostUp", post_up)
            .with("PostDown", post_down),
        peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::PortRange;

    fn allocation() -> InstanceAllocation {
        InstanceAllocation {
            ordinal: 0,
            name: "wg0".to_string(),
            listen_port: 52835,
            forward_range: PortRange::new(55835, 56834),
            server_address: "10.0.1.1/24".parse().unwrap(),
        }
    }

    #[test]
    fn test_client_config_layout() {
        let network = EngineConfig::default().network;
        let text = client_config(
            &ClientParams {
                private_key: "cli",
                address: "10.0.1.2/24".parse().unwrap(),
                server_public_key: "srv",
                endpoint: Ipv4Addr::new(203, 0, 113, 5),
                endpoint_port: 52835,
            },
            &network,
        );
        assert_eq!(
            text,
            "[Interface]\nPrivateKey = cli\nAddress = 10.0.1.2/24\nDNS = 1.1.1.1\n\n\
             [Peer]\nPublicKey = srv\nEndpoint = 203.0.113.5:52835\nAllowedIPs = 0.0.0.0/0, ::/0\nPersistentKeepalive = 25\n"
        );
    }

    #[test]
    fn test_server_config_hooks() {
        let config = server_config(
            &allocation(),
            "key",
            Ipv4Addr::new(203, 0, 113, 5),
            "eth0",
            vec![server_peer("peer1", Ipv4Addr::new(10, 0, 1, 2))],
        );
        let post_up = config.interface.get("PostUp").unwrap();
        assert!(post_up.contains("-s 10.0.1.0/24 -o eth0 -j SNAT --to-source 203.0.113.5"));
        assert!(post_up.contains("$(seq 55835 56834)"));
        assert!(post_up.contains("--to-destination 203.0.113.5:52835"));
        assert!(config.interface.get("PostDown").unwrap().contains("iptables -D FORWARD"));

        let text = config.render();
        assert!(text.ends_with("\n\n[Peer]\nPublicKey = peer1\nAllowedIPs = 10.0.1.2/32\n"));
    }

    #[test]
    fn test_append_and_remove_peer() {
        let base = "[Interface]\nAddress = 10.0.1.1/24\nListenPort = 52835\n\n[Peer]\nPublicKey = one\nAllowedIPs = 10.0.1.2/32\n";
        let appended = append_peer(base, &server_peer("two", Ipv4Addr::new(10, 0, 1, 3)));
        assert_eq!(
            appended,
            format!("{}\n[Peer]\nPublicKey = two\nAllowedIPs = 10.0.1.3/32\n", base)
        );

        let removed = remove_peer(&appended, "one").unwrap();
        assert_eq!(
            removed,
            "[Interface]\nAddress = 10.0.1.1/24\nListenPort = 52835\n\n[Peer]\nPublicKey = two\nAllowedIPs = 10.0.1.3/32\n"
        );
        assert_eq!(remove_peer(&removed, "two").unwrap(), "[Interface]\nAddress = 10.0.1.1/24\nListenPort = 52835\n");
        assert!(remove_peer(base, "missing").is_none());
    }
}
