//! Read-only troubleshooting report for a host
//!
//! Runs a fixed battery of status commands plus service and journal checks
//! for every instance discovery finds. Nothing here writes to the host, and
//! no command prints a config file, since those hold private keys.

use crate::reconcile;
use crate::session::{quote, RemoteShell};
use crate::EngineConfig;
use chrono::{DateTime, Local};
use serde::Serialize;

/// Output of one diagnostic command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSection {
    pub title: String,
    pub command: String,
    /// Whether the command ran and exited 0
    pub ok: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub host: String,
    pub generated_at: DateTime<Local>,
    pub sections: Vec<DiagnosticSection>,
}

impl DiagnosticReport {
    pub fn section(&self, title: &str) -> Option<&DiagnosticSection> {
        self.sections.iter().find(|s| s.title == title)
    }

    /// Plain-text report with one `== title ==` block per command
    pub fn render(&self) -> String {
        let mut out = format!(
            "WireGuard diagnostics for {} at {}\n",
            self.host,
            self.generated_at.format("%Y-%m-%d %H:%M:%S")
        );
        for section in &self.sections {
            out.push_str(&format!("\n== {} ==\n$ {}\n", section.title, section.command));
            out.push_str(&section.output);
            if !section.output.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

fn host_battery(config: &EngineConfig) -> Vec<(&'static str, String)> {
    vec![
        ("WireGuard status", "wg show".to_string()),
        ("Interfaces", "ip -br addr".to_string()),
        ("Routes", "ip route".to_string()),
        ("Default route", "ip -4 route show default".to_string()),
        ("Firewall (ufw)", "ufw status verbose".to_string()),
        ("Forward chain", "iptables -L FORWARD -n -v".to_string()),
        ("NAT POSTROUTING", "iptables -t nat -L POSTROUTING -n -v".to_string()),
        (
            "NAT PREROUTING",
            "iptables -t nat -L PREROUTING -n -v | head -n 40".to_string(),
        ),
        (
            "IP forwarding",
            "sysctl net.ipv4.ip_forward; grep -i ip_forward /etc/sysctl.conf".to_string(),
        ),
        (
            "WireGuard directory",
            format!("ls -la {}", quote(&config.paths.wireguard_dir)),
        ),
        (
            "Deployment directory",
            format!("ls -la {}", quote(&config.paths.deploy_dir)),
        ),
        ("Connectivity", "ping -c 3 -W 2 1.1.1.1".to_string()),
        (
            "Listening UDP ports",
            "ss -uln 2>/dev/null || netstat -uln".to_string(),
        ),
        (
            "Kernel messages",
            "dmesg 2>/dev/null | grep -i -E 'wireguard|wg[0-9]' | tail -n 10".to_string(),
        ),
    ]
}

fn run(shell: &dyn RemoteShell, title: &str, command: String) -> DiagnosticSection {
    let (ok, output) = match shell.exec(&command) {
        Ok(out) if out.success() => (true, out.stdout),
        Ok(out) => {
            let mut text = out.stdout;
            text.push_str(&out.stderr);
            if text.trim().is_empty() {
                text = format!("(exit {})", out.exit_code);
            }
            (false, text)
        }
        Err(e) => {
            log::debug!("[{}] diagnostic '{}' failed: {}", shell.host_id(), title, e);
            (false, format!("unavailable: {}", e))
        }
    };
    DiagnosticSection {
        title: title.to_string(),
        command,
        ok,
        output,
    }
}

/// Collect the diagnostic report. Individual command failures are reported
/// in their section and never abort the battery.
pub fn diagnose(shell: &dyn RemoteShell, config: &EngineConfig) -> DiagnosticReport {
    let mut sections: Vec<DiagnosticSection> = host_battery(config)
        .into_iter()
        .map(|(title, command)| run(shell, title, command))
        .collect();

    for instance in reconcile::list_instances(shell, config) {
        let name = quote(&instance.name);
        sections.push(run(
            shell,
            &format!("Service wg-quick@{}", instance.name),
            format!("systemctl status wg-quick@{} --no-pager -l", name),
        ));
        sections.push(run(
            shell,
            &format!("Journal wg-quick@{}", instance.name),
            format!("journalctl -u wg-quick@{} --no-pager -n 20", name),
        ));
    }

    log::info!(
        "[{}] diagnostics collected: {} sections, {} failed",
        shell.host_id(),
        sections.len(),
        sections.iter().filter(|s| !s.ok).count()
    );
    DiagnosticReport {
        host: shell.host_id().to_string(),
        generated_at: Local::now(),
        sections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedShell;
    use crate::session::CommandOutput;

    fn host() -> ScriptedShell {
        let shell = ScriptedShell::new("vps-1");
        shell.with_file(
            "/etc/wireguard/wg0.conf",
            &format!(
                "[Interface]\nAddress = 10.0.1.1/24\nPrivateKey = {}\n",
                ScriptedShell::fake_key(7)
            ),
        );
        shell.on(
            "wg show",
            CommandOutput::ok("interface: wg0\n  public key: abc\n  private key: (hidden)\n"),
        );
        shell.on("wg show interfaces", CommandOutput::ok("wg0\n"));
        shell.on("ip -br addr", CommandOutput::ok("eth0 UP 203.0.113.5/24\n"));
        shell.on("systemctl status", CommandOutput::ok("active (exited)\n"));
        shell.on("journalctl -u", CommandOutput::ok("Started WireGuard via wg-quick(8) for wg0.\n"));
        shell
    }

    #[test]
    fn test_report_covers_host_and_instances() {
        let shell = host();
        let report = diagnose(&shell, &EngineConfig::default());

        assert_eq!(report.host, "vps-1");
        assert!(report.section("WireGuard status").unwrap().ok);
        assert!(report.section("Interfaces").unwrap().output.contains("203.0.113.5"));
        let service = report.section("Service wg-quick@wg0").unwrap();
        assert_eq!(service.command, "systemctl status wg-quick@wg0 --no-pager -l");
        assert!(report.section("Journal wg-quick@wg0").unwrap().ok);

        let text = report.render();
        assert!(text.contains("== Routes ==\n$ ip route\n"));
        assert!(text.contains("Started WireGuard"));
    }

    #[test]
    fn test_failed_commands_are_reported_not_fatal() {
        let shell = host();
        shell.on("ufw status", CommandOutput::failed(1, "ufw: command not found"));
        shell.on_io_error("ping -c");
        let report = diagnose(&shell, &EngineConfig::default());

        let ufw = report.section("Firewall (ufw)").unwrap();
        assert!(!ufw.ok);
        assert!(ufw.output.contains("command not found"));
        let ping = report.section("Connectivity").unwrap();
        assert!(!ping.ok);
        assert!(ping.output.starts_with("unavailable"));
        assert!(report.section("Kernel messages").is_some());
    }

    #[test]
    fn test_report_never_reads_config_files() {
        let shell = host();
        let report = diagnose(&shell, &EngineConfig::default());
        assert!(!shell.ran("cat "));
        assert!(!report.render().contains(&ScriptedShell::fake_key(7)));
        assert!(!shell.commands().iter().any(|c| c.contains("dump") || c.contains("showconf")));
    }
}
