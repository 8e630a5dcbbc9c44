//! Guarded command execution for ad-hoc inspection
//!
//! Interactive programs would hang an exec channel that has no terminal, so
//! they are rejected before anything is sent and the caller gets a
//! non-interactive alternative instead.

use crate::session::{CommandOutput, SessionRegistry};
use crate::{Error, Result};

const INTERACTIVE: &[&str] = &["vim", "vi", "nano", "emacs", "top", "htop", "less", "more"];

fn alternative(program: &str) -> &'static str {
    match program {
        "vim" | "vi" | "nano" | "emacs" => {
            "Use 'cat <file>' to view a file or 'echo \"content\" > <file>' to write one"
        }
        "top" | "htop" => "Use 'ps aux' to list processes",
        "less" | "more" => "Use 'cat <file>' to view the file",
        _ => "Use a non-interactive command instead",
    }
}

/// The program a command line would run, skipping `sudo` and any directory
fn program_of(command: &str) -> Option<&str> {
    let mut words = command.split_whitespace();
    let mut first = words.next()?;
    if first == "sudo" {
        first = words.find(|w| !w.starts_with('-'))?;
    }
    Some(first.rsplit('/').next().unwrap_or(first))
}

/// Reject interactive programs, naming an alternative
pub fn check_command(command: &str) -> Result<()> {
    match program_of(command) {
        Some(program) if INTERACTIVE.contains(&program) => Err(Error::CommandRejected {
            program: program.to_string(),
            suggestion: alternative(program).to_string(),
        }),
        Some(_) => Ok(()),
        None => Err(Error::validation("Command cannot be empty")),
    }
}

/// Run one command on the session registered for `host_id`
pub fn execute(registry: &SessionRegistry, host_id: &str, command: &str) -> Result<CommandOutput> {
    let shell = registry.get(host_id)?;
    check_command(command)?;
    log::info!("[{}] exec: {}", host_id, command);
    shell.exec(command)
}
