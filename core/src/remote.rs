//! Typed helpers over [`RemoteShell`] for the file and key operations the
//! engine performs on a host

use crate::session::{quote, RemoteShell};
use crate::{Error, Result};
use std::path::Path;

/// Read a remote file, `None` if it is missing or unreadable
pub fn read_file(shell: &dyn RemoteShell, path: &str) -> Result<Option<String>> {
    let out = shell.exec(&format!("cat {} 2>/dev/null", quote(path)))?;
    if out.success() && !out.stdout.trim().is_empty() {
        Ok(Some(out.stdout))
    } else {
        Ok(None)
    }
}

pub fn file_exists(shell: &dyn RemoteShell, path: &str) -> Result<bool> {
    let out = shell.exec(&format!("test -f {} && echo exists", quote(path)))?;
    Ok(out.success() && out.stdout.contains("exists"))
}

/// Files in `dir` (not recursive) whose name matches the `*` glob `pattern`
pub fn list_files(shell: &dyn RemoteShell, dir: &str, pattern: &str) -> Result<Vec<String>> {
    let out = shell.exec(&format!(
        "find {} -maxdepth 1 -type f -name {} 2>/dev/null",
        quote(dir),
        quote(pattern)
    ))?;
    let mut files: Vec<String> = out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    files.sort();
    Ok(files)
}

pub fn remove_files(shell: &dyn RemoteShell, paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let args: Vec<String> = paths.iter().map(|p| quote(p).into_owned()).collect();
    let out = shell.exec(&format!("rm -f {}", args.join(" ")))?;
    if !out.success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "rm failed: {}",
            out.stderr.trim()
        ))));
    }
    Ok(())
}

/// Generate a keypair with the remote `wg` tool, storing both halves in files
///
/// Returns `(private, public)`.
pub fn generate_keypair(
    shell: &dyn RemoteShell,
    key_path: &str,
    pub_path: &str,
) -> Result<(String, String)> {
    let dir = parent_dir(key_path);
    let out = shell.exec(&format!(
        "umask 077 && mkdir -p {dir} && wg genkey | tee {key} | wg pubkey > {public} && cat {key} {public}",
        dir = quote(dir),
        key = quote(key_path),
        public = quote(pub_path),
    ))?;
    let mut lines = out.stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    match (out.success(), lines.next(), lines.next()) {
        (true, Some(private), Some(public)) => Ok((private.to_string(), public.to_string())),
        _ => Err(Error::Io(std::io::Error::other(format!(
            "key generation failed: {}",
            out.stderr.trim()
        )))),
    }
}

/// Generate a lone private key without persisting it
pub fn generate_private_key(shell: &dyn RemoteShell) -> Result<String> {
    let out = shell.exec("wg genkey")?;
    out.text().map(str::to_string).ok_or_else(|| {
        Error::Io(std::io::Error::other(format!(
            "wg genkey failed: {}",
            out.stderr.trim()
        )))
    })
}

pub fn restart_service(shell: &dyn RemoteShell, instance: &str) -> Result<()> {
    let out = shell.exec(&format!("systemctl restart wg-quick@{}", quote(instance)))?;
    if !out.success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "systemctl restart wg-quick@{} exited {}: {}",
            instance,
            out.exit_code,
            out.stderr.trim()
        ))));
    }
    log::info!("[{}] restarted wg-quick@{}", shell.host_id(), instance);
    Ok(())
}

pub fn parent_dir(path: &str) -> &str {
    Path::new(path)
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
}

/// File name component of a remote path
pub fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedShell;
    use crate::session::CommandOutput;

    #[test]
    fn test_read_missing_file() {
        let shell = ScriptedShell::new("h");
        assert_eq!(read_file(&shell, "/etc/wireguard/wg0.conf").unwrap(), None);
        shell.with_file("/etc/wireguard/wg0.conf", "[Interface]\n");
        assert_eq!(
            read_file(&shell, "/etc/wireguard/wg0.conf").unwrap().as_deref(),
            Some("[Interface]\n")
        );
    }

    #[test]
    fn test_list_files_with_quoted_dir() {
        let shell = ScriptedShell::new("h");
        shell.with_file("/root/VPS配置WG/wg0-peer2-client.conf", "x");
        shell.with_file("/root/VPS配置WG/wg0-peer1-client.conf", "x");
        shell.with_file("/root/VPS配置WG/wg0-peer1.key", "x");
        let files = list_files(&shell, "/root/VPS配置WG", "wg0-peer*-client.conf").unwrap();
        assert_eq!(
            files,
            vec![
                "/root/VPS配置WG/wg0-peer1-client.conf",
                "/root/VPS配置WG/wg0-peer2-client.conf"
            ]
        );
    }

    #[test]
    fn test_generate_keypair() {
        let shell = ScriptedShell::new("h");
        let (private, public) = generate_keypair(&shell, "/d/wg0-server.key", "/d/wg0-server.pub").unwrap();
        assert_ne!(private, public);
        assert_eq!(shell.file("/d/wg0-server.pub").unwrap().trim(), public);
    }

    #[test]
    fn test_restart_failure_is_error() {
        let shell = ScriptedShell::new("h");
        shell.on("systemctl restart", CommandOutput::failed(1, "Job failed"));
        assert!(restart_service(&shell, "wg0").is_err());
        shell.on("systemctl restart", CommandOutput::ok(""));
        assert!(restart_service(&shell, "wg0").is_ok());
    }
}
