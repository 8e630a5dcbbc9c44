//! wg-remote - manage WireGuard instances on remote Linux hosts over SSH

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use wg_remote_core::{
    diagnose, execute, get_instance_details, list_instances, provision, CredentialStore, EngineConfig,
    Error, HostFile, InstanceDetail, InstanceSummary, PeerManager, ProgressEvent,
    ProvisionResult, Result, SessionHandle, SessionRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "wg-remote", version, about)]
struct Args {
    /// Engine configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Host credential file
    #[arg(long, value_name = "PATH")]
    hosts: Option<PathBuf>,
    /// Print machine-readable JSON instead of text
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Test the SSH connection to a host
    Check { server: String },
    /// List WireGuard instances found on a host
    List { server: String },
    /// Show the reconciled state of one instance
    Show { server: String, iface: String },
    /// Create an instance for each public address that has none
    Provision { server: String },
    /// Add a peer to an instance and print its client config
    AddPeer { server: String, iface: String },
    /// Remove a peer from an instance
    RemovePeer {
        server: String,
        iface: String,
        ordinal: u32,
    },
    /// Print a read-only troubleshooting report for a host
    Diagnose { server: String },
    /// Run a non-interactive command on a host
    Exec {
        server: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

impl Command {
    fn server(&self) -> &str {
        match self {
            Command::Check { server }
            | Command::List { server }
            | Command::Show { server, .. }
            | Command::Provision { server }
            | Command::AddPeer { server, .. }
            | Command::RemovePeer { server, .. }
            | Command::Diagnose { server }
            | Command::Exec { server, .. } => server,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            if args.json {
                let body = serde_json::json!({ "error": e.to_string(), "kind": e.kind() });
                println!("{}", body);
            } else {
                eprintln!("error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    match &args.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_or_default(),
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let config = load_config(args)?;
    let hosts = HostFile::load(&args.hosts.clone().unwrap_or_else(HostFile::default_path))?;
    let server = args.command.server();
    let credential = hosts
        .credential(server)
        .ok_or_else(|| Error::config(format!("no host '{}' in the host file", server)))?;

    let registry = SessionRegistry::new();
    let shell = registry.connect(&credential, &config)?;
    let code = dispatch(args, &config, &registry, shell);
    registry.close_all();
    code
}

fn dispatch(
    args: &Args,
    config: &EngineConfig,
    registry: &SessionRegistry,
    shell: SessionHandle,
) -> Result<ExitCode> {
    match &args.command {
        Command::Check { server } => {
            let out = execute(registry, server, "uname -srm")?;
            if args.json {
                print_json(&serde_json::json!({ "server": server, "connected": true, "uname": out.stdout.trim() }))?;
            } else {
                println!("{}: connected ({})", server, out.stdout.trim());
            }
        }
        Command::List { .. } => {
            let instances = list_instances(shell.as_ref(), config);
            if args.json {
                print_json(&instances)?;
            } else {
                print_summaries(&instances);
            }
        }
        Command::Show { iface, .. } => {
            let detail = get_instance_details(shell.as_ref(), config, iface)?;
            if args.json {
                print_json(&detail)?;
            } else {
                print_detail(&detail);
            }
        }
        Command::Provision { .. } => {
            let result = run_provision(args.json, shell, config)?;
            if args.json {
                print_json(&result)?;
            } else {
                print_provision(&result);
            }
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::AddPeer { iface, .. } => {
            let peer = PeerManager::new(config.clone()).add_peer(shell.as_ref(), iface)?;
            if args.json {
                print_json(&peer)?;
            } else {
                println!("# peer {} of {} ({}) saved to {}", peer.ordinal, peer.instance, peer.address, peer.file);
                print!("{}", peer.config);
            }
        }
        Command::RemovePeer { iface, ordinal, .. } => {
            let ack = PeerManager::new(config.clone()).remove_peer(shell.as_ref(), iface, *ordinal)?;
            if args.json {
                print_json(&ack)?;
            } else {
                println!("{}", ack.message);
            }
        }
        Command::Diagnose { .. } => {
            let report = diagnose(shell.as_ref(), config);
            if args.json {
                print_json(&report)?;
            } else {
                print!("{}", report.render());
            }
        }
        Command::Exec { server, command } => {
            let out = execute(registry, server, &command.join(" "))?;
            if args.json {
                print_json(&out)?;
            } else {
                print!("{}", out.stdout);
                eprint!("{}", out.stderr);
            }
            if !out.success() {
                return Ok(ExitCode::from(out.exit_code.clamp(1, 255) as u8));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_provision(json: bool, shell: SessionHandle, config: &EngineConfig) -> Result<ProvisionResult> {
    let handle = provision(shell, config.clone())?;
    for event in handle.events().iter() {
        if !json {
            print_event(&event);
        }
    }
    Ok(handle.wait())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    println!(
        "{} [{:>3}%] {:?}: {}",
        event.at.format("%H:%M:%S"),
        event.percent,
        event.state,
        event.message
    );
}

fn print_summaries(instances: &[InstanceSummary]) {
    if instances.is_empty() {
        println!("no WireGuard instances found");
        return;
    }
    println!("{:<16} {:<10} SOURCES", "NAME", "STATUS");
    for instance in instances {
        let sources: Vec<&str> = instance.sources.iter().map(|s| s.as_str()).collect();
        println!(
            "{:<16} {:<10} {}",
            instance.name,
            format!("{:?}", instance.status),
            sources.join(", ")
        );
    }
}

fn print_detail(detail: &InstanceDetail) {
    let or_unknown = |v: Option<String>| v.unwrap_or_else(|| "unknown".to_string());
    println!("instance:       {}", detail.name);
    println!("status:         {:?}", detail.status);
    println!(
        "config source:  {}",
        or_unknown(detail.config_source.map(|s| format!("{:?}", s)))
    );
    println!("address:        {}", or_unknown(detail.address.map(|a| a.to_string())));
    println!("listen port:    {}", or_unknown(detail.listen_port.map(|p| p.to_string())));
    println!("public key:     {}", or_unknown(detail.public_key.clone()));
    println!("private key at: {}", or_unknown(detail.private_key_ref.clone()));
    println!(
        "forwarded:      {}",
        or_unknown(
            detail
                .port_mapping
                .map(|m| format!("{} ({:?})", m.range, m.source))
        )
    );
    println!(
        "public address: {}",
        or_unknown(detail.public_address.map(|a| a.to_string()))
    );
    println!("peers:");
    for peer in &detail.peers {
        println!(
            "  {:>3}  {:<15}  {}",
            peer.ordinal,
            or_unknown(peer.address.map(|a| a.to_string())),
            peer.file
        );
    }
    for warning in &detail.warnings {
        println!("warning: {}", warning);
    }
}

fn print_provision(result: &ProvisionResult) {
    println!("{:?}: {}", result.state, result.instances.join(", "));
    if let Some(warning) = &result.warning {
        println!("warning: {}", warning);
    }
    for file in &result.client_configs {
        println!("\n# {}", file.path);
        print!("{}", file.content);
    }
}
