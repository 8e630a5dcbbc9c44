//! WireGuard configuration file parsing and rendering
//!
//! The grammar is the INI-like format read by `wg` and `wg-quick`: an
//! `[Interface]` section followed by any number of `[Peer]` sections, each
//! holding `Key = Value` lines. Key order and spelling are preserved so a
//! parsed file renders back to the same fields.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// One `[Interface]` or `[Peer]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((key.to_string(), value.into()));
    }

    /// First value for `key`, compared case-insensitively
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first value for `key`, or append it
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.get("PublicKey")
    }

    pub fn private_key(&self) -> Option<&str> {
        self.get("PrivateKey")
    }

    /// First IPv4 network in `Address`
    pub fn address(&self) -> Option<Ipv4Net> {
        first_ipv4_net(self.get("Address")?)
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.get("ListenPort")?.trim().parse().ok()
    }

    /// IPv4 networks in `AllowedIPs`
    pub fn allowed_ips(&self) -> Vec<Ipv4Net> {
        self.get("AllowedIPs")
            .map(|v| v.split(',').filter_map(parse_ipv4_net).collect())
            .unwrap_or_default()
    }

    /// `Endpoint` split into host and port
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        let (host, port) = self.get("Endpoint")?.trim().rsplit_once(':')?;
        Some((host.trim_matches(|c| c == '[' || c == ']'), port.parse().ok()?))
    }

    /// Render under `header`, e.g. `[Peer]`
    pub fn render(&self, header: &str) -> String {
        let mut out = String::new();
        self.render_into(header, &mut out);
        out
    }

    fn render_into(&self, header: &str, out: &mut String) {
        out.push_str(header);
        out.push('\n');
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        }
    }
}

/// A whole WireGuard configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: Section,
    pub peers: Vec<Section>,
}

enum Current {
    None,
    Interface,
    Peer,
    Other,
}

impl WgConfig {
    /// Parse configuration text; `None` when there is no `[Interface]` section
    pub fn parse(content: &str) -> Option<Self> {
        let mut config = WgConfig::default();
        let mut seen_interface = false;
        let mut current = Current::None;

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                current = match line.to_lowercase().as_str() {
                    "[interface]" => {
                        seen_interface = true;
                        Current::Interface
                    }
                    "[peer]" => {
                        config.peers.push(Section::new());
                        Current::Peer
                    }
                    _ => Current::Other,
                };
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                match current {
                    Current::Interface => config.interface.push(key, value),
                    Current::Peer => {
                        if let Some(peer) = config.peers.last_mut() {
                            peer.push(key, value);
                        }
                    }
                    Current::None | Current::Other => {}
                }
            }
        }

        seen_interface.then_some(config)
    }

    /// Render in `wg-quick` layout with one blank line between sections
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.interface.render_into("[Interface]", &mut out);
        for peer in &self.peers {
            out.push('\n');
            peer.render_into("[Peer]", &mut out);
        }
        out
    }

    pub fn peer_by_key(&self, public_key: &str) -> Option<&Section> {
        self.peers
            .iter()
            .find(|p| p.public_key() == Some(public_key))
    }

    /// Every IPv4 network claimed by a peer's `AllowedIPs`, at any prefix length
    pub fn claimed_networks(&self) -> Vec<Ipv4Net> {
        self.peers
            .iter()
            .flat_map(|p| p.allowed_ips())
            .map(|n| n.trunc())
            .collect()
    }
}

fn parse_ipv4_net(s: &str) -> Option<Ipv4Net> {
    let s = s.trim();
    s.parse::<Ipv4Net>()
        .ok()
        .or_else(|| s.parse::<Ipv4Addr>().ok().map(Ipv4Net::from))
}

fn first_ipv4_net(list: &str) -> Option<Ipv4Net> {
    list.split(',').find_map(parse_ipv4_net)
}

/// True if `key` looks like a WireGuard key: base64 of exactly 32 bytes
pub fn is_valid_key(key: &str) -> bool {
    let key = key.trim();
    key.len() == 44
        && STANDARD
            .decode(key)
            .map(|bytes| bytes.len() == 32)
            .unwrap_or(false)
}
