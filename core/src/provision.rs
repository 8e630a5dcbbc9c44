//! Provisioning driver
//!
//! A provisioning operation installs the WireGuard tooling, plans one new
//! instance per public address that has none yet, uploads a generated
//! script and launches it detached so a dropped session cannot kill it. The
//! driver then polls the host until the client configs appear, the script
//! exits, or the timeout passes.
//!
//! The operation runs on its own thread. Progress arrives on a channel that
//! closes when the operation ends; the final [`ProvisionResult`] comes from
//! [`ProvisionHandle::wait`].

use crate::allocate::{self, Claim};
use crate::endpoint;
use crate::reconcile::Reconciler;
use crate::remote;
use crate::session::{heredoc_write_command, quote, SessionHandle};
use crate::synth::{self, ClientParams};
use crate::{
    ClientConfigFile, EngineConfig, Error, InstanceAllocation, ProgressEvent, ProvisionResult,
    ProvisionState, Result,
};
use chrono::Local;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use uuid::Uuid;

const MARKER: &str = "[wg-remote]";

/// Script markers and the progress they stand for, in script order
pub const MILESTONES: &[(&str, u8)] = &[
    ("[wg-remote] preparing directories", 20),
    ("[wg-remote] enabling ip forwarding", 30),
    ("[wg-remote] writing server config", 45),
    ("[wg-remote] opening firewall", 60),
    ("[wg-remote] starting interface", 75),
    ("[wg-remote] writing client config", 85),
    ("[wg-remote] provisioning complete", 90),
];

const INSTALL_COMMAND: &str = "if command -v apt-get >/dev/null 2>&1; then \
     export DEBIAN_FRONTEND=noninteractive; apt-get update -y && apt-get install -y wireguard wireguard-tools iptables curl; \
     elif command -v dnf >/dev/null 2>&1; then dnf install -y wireguard-tools iptables curl; \
     elif command -v yum >/dev/null 2>&1; then yum install -y epel-release && yum install -y wireguard-tools iptables curl; \
     else echo 'no supported package manager' >&2; exit 1; fi";

/// One instance the script will create
#[derive(Debug, Clone)]
pub struct PlannedInstance {
    pub allocation: InstanceAllocation,
    pub public_ip: Ipv4Addr,
    pub server_config: String,
    pub client_config: String,
}

/// Everything the provisioning script needs
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub external_iface: String,
    pub instances: Vec<PlannedInstance>,
}

/// Handle to a running provisioning operation
pub struct ProvisionHandle {
    pub operation_id: Uuid,
    events: Receiver<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<ProvisionResult>,
}

impl ProvisionHandle {
    /// Progress stream; iteration ends when the operation finishes
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Ask the driver to stop at its next poll boundary
    ///
    /// A script that is already running on the host is not killed.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Block until the operation ends
    pub fn wait(self) -> ProvisionResult {
        let operation_id = self.operation_id;
        drop(self.events);
        self.worker.join().unwrap_or_else(|_| ProvisionResult {
            operation_id,
            state: ProvisionState::Failed,
            success: false,
            warning: Some("provisioning worker panicked".to_string()),
            instances: Vec::new(),
            client_configs: Vec::new(),
            output: String::new(),
        })
    }
}

/// Start provisioning `shell`'s host in the background
pub fn provision(shell: SessionHandle, config: EngineConfig) -> Result<ProvisionHandle> {
    config.validate()?;
    let operation_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let driver = Provisioner {
        shell,
        config,
        operation_id,
        events: tx,
        cancel: cancel.clone(),
        percent: 0,
        output: String::new(),
        instances: Vec::new(),
    };
    let worker = thread::Builder::new()
        .name(format!("provision-{}", operation_id))
        .spawn(move || driver.run())?;
    Ok(ProvisionHandle {
        operation_id,
        events: rx,
        cancel,
        worker,
    })
}

struct Provisioner {
    shell: SessionHandle,
    config: EngineConfig,
    operation_id: Uuid,
    events: Sender<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    percent: u8,
    output: String,
    instances: Vec<String>,
}

/// Terminal state and optional warning
type Outcome = (ProvisionState, Option<String>);

impl Provisioner {
    fn run(mut self) -> ProvisionResult {
        let (state, warning) = match self.drive() {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("[{}] provisioning failed: {}", self.shell.host_id(), e);
                (ProvisionState::Failed, Some(e.to_string()))
            }
        };
        self.finish(state, warning)
    }

    fn emit(&mut self, state: ProvisionState, percent: u8, message: impl Into<String>) {
        self.percent = self.percent.max(percent);
        let event = ProgressEvent {
            operation_id: self.operation_id,
            percent: self.percent,
            message: message.into(),
            state,
            at: Local::now(),
        };
        log::info!(
            "[{}] provision {}% {:?}: {}",
            self.shell.host_id(),
            event.percent,
            state,
            event.message
        );
        // a caller that stopped listening still gets the final result
        let _ = self.events.send(event);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn drive(&mut self) -> Result<Outcome> {
        let host = self.shell.host_id().to_string();
        self.emit(
            ProvisionState::Starting,
            5,
            format!("starting provisioning on {}", host),
        );

        self.emit(
            ProvisionState::InstallingDependencies,
            10,
            "checking WireGuard tooling",
        );
        self.install_dependencies()?;
        if self.cancelled() {
            return Ok(cancelled_before_launch());
        }

        let plan = self.plan()?;
        if plan.instances.is_empty() {
            return Ok((
                ProvisionState::Succeeded,
                Some("every public address already has an instance".to_string()),
            ));
        }
        self.instances = plan
            .instances
            .iter()
            .map(|p| p.allocation.name.clone())
            .collect();

        let script = build_script(&plan, &self.config)?;
        self.shell
            .write_file(&self.config.paths.script_path, &script, 0o700)?;
        self.emit(
            ProvisionState::ScriptUploaded,
            15,
            format!("uploaded script for {}", self.instances.join(", ")),
        );
        if self.cancelled() {
            return Ok(cancelled_before_launch());
        }

        let pid = self.launch()?;
        self.emit(
            ProvisionState::Running,
            18,
            format!("script running as pid {}", pid),
        );
        self.poll(pid)
    }

    fn install_dependencies(&mut self) -> Result<()> {
        let check = self
            .shell
            .exec("command -v wg >/dev/null 2>&1 && command -v wg-quick >/dev/null 2>&1")?;
        if check.success() {
            return Ok(());
        }
        self.emit(
            ProvisionState::InstallingDependencies,
            12,
            "installing wireguard-tools",
        );
        let out = self
            .shell
            .exec_with_timeout(INSTALL_COMMAND, self.config.install_timeout())?;
        if !out.success() {
            return Err(Error::provisioning(format!(
                "package installation failed (exit {}): {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Allocate one instance per public address not yet served
    fn plan(&self) -> Result<ProvisionPlan> {
        let shell = self.shell.as_ref();
        let existing = Reconciler::new(shell, &self.config).snapshot()?;
        let served: Vec<Ipv4Addr> = existing.iter().filter_map(|d| d.public_address).collect();
        let mut claims: Vec<Claim> = existing.iter().map(Claim::from).collect();

        let (external_iface, addrs) = endpoint::host_addresses(shell)?;
        let mut instances = Vec::new();
        for public_ip in addrs {
            if served.contains(&public_ip) {
                log::info!("[{}] {} already has an instance", shell.host_id(), public_ip);
                continue;
            }
            let allocation = allocate::next_instance_allocation(&claims, &self.config.network)?;
            claims.push(Claim::from(&allocation));
            instances.push(self.plan_instance(allocation, public_ip, &external_iface)?);
        }
        Ok(ProvisionPlan {
            external_iface,
            instances,
        })
    }

    fn plan_instance(
        &self,
        allocation: InstanceAllocation,
        public_ip: Ipv4Addr,
        external_iface: &str,
    ) -> Result<PlannedInstance> {
        let shell = self.shell.as_ref();
        let name = allocation.name.as_str();
        let (server_private, server_public) = remote::generate_keypair(
            shell,
            &self.config.server_key_path(name),
            &self.config.server_pub_path(name),
        )?;
        let (peer_private, peer_public) = remote::generate_keypair(
            shell,
            &self.config.peer_key_path(name, 1),
            &self.config.peer_pub_path(name, 1),
        )?;

        let peer_address = allocate::next_free_address(
            allocation.subnet(),
            &[Ipv4Net::from(allocation.server_address.addr())],
        )?;
        let server = synth::server_config(
            &allocation,
            &server_private,
            public_ip,
            external_iface,
            vec![synth::server_peer(&peer_public, peer_address)],
        );
        let client = synth::client_config(
            &ClientParams {
                private_key: &peer_private,
                address: Ipv4Net::new(peer_address, allocation.server_address.prefix_len())
                    .map_err(|e| Error::provisioning(e.to_string()))?,
                server_public_key: &server_public,
                endpoint: public_ip,
                endpoint_port: allocation.listen_port,
            },
            &self.config.network,
        );
        log::info!(
            "[{}] planned {} on {} port {} range {}",
            shell.host_id(),
            name,
            public_ip,
            allocation.listen_port,
            allocation.forward_range
        );
        Ok(PlannedInstance {
            allocation,
            public_ip,
            server_config: server.render(),
            client_config: client,
        })
    }

    fn launch(&self) -> Result<u32> {
        let paths = &self.config.paths;
        let out = self.shell.exec(&format!(
            "rm -f {log} {pid}; nohup bash {script} > {log} 2>&1 < /dev/null & echo $! > {pid}; cat {pid}",
            script = quote(&paths.script_path),
            log = quote(&paths.log_path),
            pid = quote(&paths.pid_path),
        ))?;
        out.text()
            .and_then(|t| t.lines().last())
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| Error::provisioning("could not start provisioning script"))
    }

    fn alive(&self, pid: u32) -> Result<bool> {
        let out = self
            .shell
            .exec(&format!("kill -0 {} 2>/dev/null && echo alive", pid))?;
        Ok(out.success() && out.stdout.contains("alive"))
    }

    /// Append any complete new log lines to the output, returning how many
    fn read_log(&mut self, lines_seen: usize) -> Result<usize> {
        let out = self.shell.exec(&format!(
            "tail -n +{} {} 2>/dev/null",
            lines_seen + 1,
            quote(&self.config.paths.log_path)
        ))?;
        if !out.success() {
            return Ok(0);
        }
        let complete = match out.stdout.rfind('\n') {
            Some(idx) => &out.stdout[..=idx],
            None => return Ok(0),
        };
        self.output.push_str(complete);
        Ok(complete.matches('\n').count())
    }

    fn report_milestones(&mut self, reached: &mut usize) {
        while let Some((marker, percent)) = MILESTONES.get(*reached) {
            if !self.output.contains(marker) {
                break;
            }
            *reached += 1;
            let message = marker.trim_start_matches(MARKER).trim().to_string();
            self.emit(ProvisionState::Running, *percent, message);
        }
    }

    fn clients_present(&self) -> Result<bool> {
        for name in &self.instances {
            let path = self.config.client_config_path(name, 1);
            if !remote::file_exists(self.shell.as_ref(), &path)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn poll(&mut self, pid: u32) -> Result<Outcome> {
        let started = Instant::now();
        let timeout = self.config.provision_timeout();
        let mut lines_seen = 0;
        let mut reached = 0;

        loop {
            if self.cancelled() {
                return Ok((
                    ProvisionState::Cancelled,
                    Some(format!(
                        "cancelled; the script (pid {}) may still be running on the host",
                        pid
                    )),
                ));
            }

            lines_seen += self.read_log(lines_seen)?;
            self.report_milestones(&mut reached);

            if self.clients_present()? {
                return Ok((ProvisionState::Succeeded, None));
            }

            if !self.alive(pid)? {
                lines_seen += self.read_log(lines_seen)?;
                self.report_milestones(&mut reached);
                if self.clients_present()? {
                    return Ok((ProvisionState::Succeeded, None));
                }
                let last = self
                    .output
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no output")
                    .to_string();
                return Ok((
                    ProvisionState::Failed,
                    Some(format!("script exited before client configs appeared: {}", last)),
                ));
            }

            if started.elapsed() >= timeout {
                return Ok((
                    ProvisionState::TimedOut,
                    Some(format!(
                        "timed out after {}s; the script (pid {}) may still be completing",
                        timeout.as_secs(),
                        pid
                    )),
                ));
            }

            thread::sleep(self.config.poll_interval());
        }
    }

    fn client_configs(&self) -> Vec<ClientConfigFile> {
        let shell = self.shell.as_ref();
        let files = remote::list_files(shell, &self.config.paths.deploy_dir, "*-peer*-client.conf")
            .unwrap_or_default();
        files
            .into_iter()
            .filter_map(|path| {
                let content = remote::read_file(shell, &path).ok()??;
                Some(ClientConfigFile {
                    name: remote::file_name(&path).to_string(),
                    path,
                    content,
                })
            })
            .collect()
    }

    fn finish(mut self, state: ProvisionState, warning: Option<String>) -> ProvisionResult {
        let client_configs = self.client_configs();
        let success = matches!(state, ProvisionState::Succeeded | ProvisionState::TimedOut);
        let percent = if state == ProvisionState::Succeeded {
            100
        } else {
            self.percent
        };
        let message = match &warning {
            Some(w) => w.clone(),
            None => format!("provisioned {}", self.instances.join(", ")),
        };
        if let Some(w) = &warning {
            log::warn!("[{}] {}", self.shell.host_id(), w);
        }
        self.emit(state, percent, message);
        ProvisionResult {
            operation_id: self.operation_id,
            state,
            success,
            warning,
            instances: self.instances,
            client_configs,
            output: self.output,
        }
    }
}

fn cancelled_before_launch() -> Outcome {
    (
        ProvisionState::Cancelled,
        Some("cancelled before the script was launched".to_string()),
    )
}

/// Render the detached provisioning script
pub fn build_script(plan: &ProvisionPlan, config: &EngineConfig) -> Result<String> {
    let paths = &config.paths;
    let mut lines: Vec<String> = vec![
        "#!/bin/bash".to_string(),
        format!("echo \"{} preparing directories\"", MARKER),
        format!(
            "mkdir -p {} {}",
            quote(&paths.wireguard_dir),
            quote(&paths.deploy_dir)
        ),
        format!("chmod 700 {}", quote(&paths.wireguard_dir)),
        format!("echo \"{} enabling ip forwarding\"", MARKER),
        "sysctl -w net.ipv4.ip_forward=1".to_string(),
        "grep -q '^net.ipv4.ip_forward *= *1' /etc/sysctl.conf || echo 'net.ipv4.ip_forward=1' >> /etc/sysctl.conf"
            .to_string(),
    ];

    for planned in &plan.instances {
        let name = planned.allocation.name.as_str();
        let range = planned.allocation.forward_range;
        lines.push(format!("echo \"{} writing server config for {}\"", MARKER, name));
        lines.push(heredoc_write_command(
            &config.server_config_path(name),
            &planned.server_config,
            0o600,
        )?);
        lines.push(format!("echo \"{} opening firewall for {}\"", MARKER, name));
        lines.push("if command -v ufw >/dev/null 2>&1; then".to_string());
        lines.push("  ufw allow 22/tcp".to_string());
        lines.push(format!("  ufw allow {}/udp", planned.allocation.listen_port));
        lines.push(format!("  ufw allow {}:{}/udp", range.start, range.end));
        lines.push("fi".to_string());
        lines.push(format!("echo \"{} starting interface {}\"", MARKER, name));
        lines.push(format!("systemctl enable wg-quick@{}", name));
        lines.push(format!(
            "systemctl restart wg-quick@{name} || {{ echo \"{marker} failed to start {name}\"; exit 1; }}",
            name = name,
            marker = MARKER
        ));
        lines.push(format!("echo \"{} writing client config for {}\"", MARKER, name));
        lines.push(heredoc_write_command(
            &config.client_config_path(name, 1),
            &planned.client_config,
            0o600,
        )?);
    }

    lines.push(format!("rm -f {}", quote(&paths.script_path)));
    lines.push(format!("echo \"{} provisioning complete\"", MARKER));
    let mut script = lines.join("\n");
    script.push('\n');
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocate::instance_allocation;
    use crate::mock::{ExecOnly, ScriptedShell};
    use crate::session::CommandOutput;
    use std::time::Duration;

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.paths.deploy_dir = "/root/wg".to_string();
        config.provision.poll_interval_ms = 1;
        config
    }

    fn single_homed(shell: &ScriptedShell) {
        shell.on("command -v wg", CommandOutput::ok(""));
        shell.on(
            "ip -4 route show default",
            CommandOutput::ok("default via 203.0.113.1 dev eth0\n"),
        );
        shell.on(
            "ip -4 -o addr show dev eth0",
            CommandOutput::ok("2: eth0    inet 203.0.113.5/24 scope global eth0\n"),
        );
        shell.on("curl", CommandOutput::ok("203.0.113.5\n"));
        shell.on("nohup bash", CommandOutput::ok("4242\n"));
    }

    #[test]
    fn test_milestones_non_decreasing() {
        assert!(MILESTONES.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!(MILESTONES.iter().all(|(m, p)| m.starts_with(MARKER) && (20..=90).contains(p)));
    }

    #[test]
    fn test_script_contents() {
        let config = fast_config();
        let allocation = instance_allocation(0, &config.network).unwrap();
        let plan = ProvisionPlan {
            external_iface: "eth0".to_string(),
            instances: vec![PlannedInstance {
                allocation,
                public_ip: Ipv4Addr::new(203, 0, 113, 5),
                server_config: "[Interface]\nListenPort = 52835\n".to_string(),
                client_config: "[Interface]\nAddress = 10.0.1.2/24\n".to_string(),
            }],
        };
        let script = build_script(&plan, &config).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("ufw allow 55835:56834/udp"));
        assert!(script.contains("cat > /etc/wireguard/wg0.conf <<'WG_REMOTE_EOF_"));
        assert!(script.contains("'\n[Interface]\nListenPort = 52835\n"));
        assert!(script.contains("systemctl restart wg-quick@wg0 ||"));
        for (marker, _) in MILESTONES {
            assert!(script.contains(marker), "{}", marker);
        }
        let server_at = script.find("wg0.conf <<").unwrap();
        let client_at = script.find("wg0-peer1-client.conf <<").unwrap();
        assert!(server_at < client_at);
    }

    #[test]
    fn test_provision_early_success() {
        let shell = Arc::new(ScriptedShell::new("vps-1"));
        single_homed(&shell);
        shell.on_sequence(
            "tail -n",
            vec![
                CommandOutput::ok("[wg-remote] preparing directories\n[wg-remote] enabling ip forwarding\n"),
                CommandOutput::ok("[wg-remote] writing server config for wg0\n[wg-remote] opening firewall for wg0\n[wg-remote] starting interface wg0\n[wg-remote] writing client config for wg0\n"),
                CommandOutput::ok(""),
            ],
        );
        shell.on("kill -0", CommandOutput::ok("alive\n"));
        // the second log read happens after the script wrote the client config
        shell.on_effect("kill -0", "/root/wg/wg0-peer1-client.conf", "[Interface]\n");

        let handle = provision(shell.clone(), fast_config()).unwrap();
        let events: Vec<ProgressEvent> = handle.events().iter().collect();
        let result = handle.wait();

        assert_eq!(result.state, ProvisionState::Succeeded);
        assert!(result.success);
        assert_eq!(result.instances, vec!["wg0"]);
        assert_eq!(result.client_configs.len(), 1);
        assert_eq!(result.client_configs[0].name, "wg0-peer1-client.conf");

        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.first().unwrap().state, ProvisionState::Starting);
        assert_eq!(events.last().unwrap().percent, 100);
        assert!(events.iter().any(|e| e.percent == 85));

        let script = shell.file(&fast_config().paths.script_path).unwrap();
        assert!(script.contains("--to-source 203.0.113.5"));
        assert!(shell.file("/root/wg/wg0-server.key").is_some());
        assert!(shell.file("/root/wg/wg0-peer1.pub").is_some());
    }

    #[test]
    fn test_provision_through_exec_only_shell() {
        let scripted = Arc::new(ScriptedShell::new("vps-1"));
        single_homed(&scripted);
        scripted.on("tail -n", CommandOutput::ok(""));
        scripted.on("kill -0", CommandOutput::ok("alive\n"));
        scripted.on_effect("kill -0", "/root/wg/wg0-peer1-client.conf", "[Interface]\n");

        let config = fast_config();
        let result = provision(Arc::new(ExecOnly(scripted.clone())), config.clone())
            .unwrap()
            .wait();
        assert_eq!(result.state, ProvisionState::Succeeded);

        let script = scripted.file(&config.paths.script_path).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("cat > /etc/wireguard/wg0.conf <<'WG_REMOTE_EOF_"));
        assert!(script.contains("systemctl restart wg-quick@wg0"));
        assert!(!scripted.ran("upload "));
    }

    #[test]
    fn test_script_exit_without_clients_fails_softly() {
        let shell = Arc::new(ScriptedShell::new("vps-1"));
        single_homed(&shell);
        shell.on(
            "tail -n",
            CommandOutput::ok("[wg-remote] starting interface wg0\n[wg-remote] failed to start wg0\n"),
        );
        shell.on("kill -0", CommandOutput::failed(1, ""));

        let handle = provision(shell.clone(), fast_config()).unwrap();
        let result = handle.wait();
        assert_eq!(result.state, ProvisionState::Failed);
        assert!(!result.success);
        assert!(result.warning.unwrap().contains("failed to start wg0"));
        assert!(result.output.contains("starting interface"));
    }

    #[test]
    fn test_timeout_is_soft_success() {
        let shell = Arc::new(ScriptedShell::new("vps-1"));
        single_homed(&shell);
        shell.on("tail -n", CommandOutput::ok(""));
        shell.on("kill -0", CommandOutput::ok("alive\n"));
        let mut config = fast_config();
        config.provision.timeout_secs = 1;
        config.provision.poll_interval_ms = 50;

        let result = provision(shell, config).unwrap().wait();
        assert_eq!(result.state, ProvisionState::TimedOut);
        assert!(result.success);
        assert!(result.warning.is_some());
    }

    #[test]
    fn test_cancel_at_poll_boundary() {
        let shell = Arc::new(ScriptedShell::new("vps-1"));
        single_homed(&shell);
        shell.on("tail -n", CommandOutput::ok(""));
        shell.on("kill -0", CommandOutput::ok("alive\n"));
        let mut config = fast_config();
        config.provision.poll_interval_ms = 20;

        let handle = provision(shell.clone(), config).unwrap();
        for event in handle.events().iter() {
            if event.state == ProvisionState::Running {
                handle.cancel();
            }
        }
        let result = handle.wait();
        assert_eq!(result.state, ProvisionState::Cancelled);
        assert!(!result.success);
        assert!(!shell.ran("kill -9"));
    }

    #[test]
    fn test_rerun_skips_served_address() {
        let shell = Arc::new(ScriptedShell::new("vps-1"));
        single_homed(&shell);
        shell.with_file(
            "/etc/wireguard/wg0.conf",
            "[Interface]\nAddress = 10.0.1.1/24\nListenPort = 52835\nPostUp = iptables -t nat -A POSTROUTING -s 10.0.1.0/24 -o eth0 -j SNAT --to-source 203.0.113.5; for port in $(seq 55835 56834); do true; done\n",
        );
        let result = provision(shell.clone(), fast_config()).unwrap().wait();
        assert_eq!(result.state, ProvisionState::Succeeded);
        assert!(result.instances.is_empty());
        assert!(!shell.ran("nohup"));
    }

    #[test]
    fn test_missing_package_manager_fails() {
        let shell = Arc::new(ScriptedShell::new("vps-1"));
        let result = provision(shell, fast_config()).unwrap().wait();
        assert_eq!(result.state, ProvisionState::Failed);
        assert!(!result.success);
    }

    #[test]
    fn test_install_gets_its_own_timeout() {
        let shell = Arc::new(ScriptedShell::new("vps-1"));
        shell.on("apt-get install", CommandOutput::failed(100, "E: Could not get lock"));
        let mut config = fast_config();
        config.provision.install_timeout_secs = 1200;

        let result = provision(shell.clone(), config).unwrap().wait();
        assert_eq!(result.state, ProvisionState::Failed);
        assert!(result.warning.unwrap_or_default().contains("Could not get lock"));
        assert_eq!(shell.timeout_of("apt-get"), Some(Duration::from_secs(1200)));
    }
}
