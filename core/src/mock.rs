//! Scripted remote shell for testing without real hosts
//!
//! `ScriptedShell` answers commands from substring rules registered by the
//! test, and otherwise simulates the handful of file commands the engine
//! issues (`cat`, `test -f`, `ls -1`, `find -name`, `rm -f`, key generation)
//! against an in-memory filesystem, including heredoc uploads. Unknown
//! commands fail with exit 127, the way a host without the tool would.

use crate::session::{CommandOutput, RemoteShell};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Rule {
    pattern: String,
    responses: VecDeque<CommandOutput>,
}

/// Test double for [`RemoteShell`]
pub struct ScriptedShell {
    host_id: String,
    rules: Mutex<Vec<Rule>>,
    files: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    effects: Mutex<Vec<(String, String, String)>>,
    broken: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<(String, Duration)>>,
    next_key: AtomicU8,
}

impl ScriptedShell {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            rules: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            effects: Mutex::new(Vec::new()),
            broken: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            next_key: AtomicU8::new(1),
        }
    }

    /// Answer every command containing `pattern` with `output`
    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.on_sequence(pattern, vec![output])
    }

    /// Answer successive matching commands in order, repeating the last one
    pub fn on_sequence(&self, pattern: &str, outputs: Vec<CommandOutput>) -> &Self {
        lock(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            responses: outputs.into(),
        });
        self
    }

    /// Create `path` as a side effect of the next command containing `pattern`
    pub fn on_effect(&self, pattern: &str, path: &str, contents: &str) -> &Self {
        lock(&self.effects).push((pattern.to_string(), path.to_string(), contents.to_string()));
        self
    }

    /// Fail every command containing `pattern` at the transport level,
    /// as a channel that returns undecodable output would
    pub fn on_io_error(&self, pattern: &str) -> &Self {
        lock(&self.broken).push(pattern.to_string());
        self
    }

    /// Place a file in the simulated filesystem
    pub fn with_file(&self, path: &str, contents: &str) -> &Self {
        lock(&self.files).insert(path.to_string(), contents.to_string());
        self
    }

    pub fn file(&self, path: &str) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        lock(&self.files).clone()
    }

    /// Every command executed so far, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        lock(&self.commands).iter().any(|c| c.contains(pattern))
    }

    /// Timeout passed to the last long-running command containing `pattern`
    pub fn timeout_of(&self, pattern: &str) -> Option<Duration> {
        lock(&self.timeouts)
            .iter()
            .rev()
            .find(|(c, _)| c.contains(pattern))
            .map(|(_, t)| *t)
    }

    /// Deterministic valid-looking WireGuard key for index `n`
    pub fn fake_key(n: u8) -> String {
        STANDARD.encode([n; 32])
    }

    fn scripted(&self, command: &str) -> Option<CommandOutput> {
        let mut rules = lock(&self.rules);
        let rule = rules
            .iter_mut()
            .rev()
            .find(|r| command.contains(&r.pattern))?;
        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }

    /// `mkdir -p D && cat > F <<'EOF'` followed by the body and `EOF`
    fn heredoc(&self, command: &str) -> Option<CommandOutput> {
        let (first, rest) = command.split_once('\n')?;
        let words = split_words(first);
        let delimiter = words.iter().find_map(|w| w.strip_prefix("<<"))?;
        let path = words
            .iter()
            .position(|w| w == ">")
            .and_then(|i| words.get(i + 1))?;
        let body = if rest.starts_with(&format!("{}\n", delimiter)) {
            ""
        } else {
            let end = rest.find(&format!("\n{}\n", delimiter))?;
            &rest[..=end]
        };
        lock(&self.files).insert(path.clone(), body.to_string());
        Some(CommandOutput::ok(""))
    }

    fn builtin(&self, command: &str) -> CommandOutput {
        let words = split_words(command);
        let words: Vec<&str> = words
            .iter()
            .map(String::as_str)
            .filter(|w| !w.starts_with("2>"))
            .collect();

        if let Some(pos) = words.iter().position(|w| *w == "genkey") {
            if words.get(pos + 2) == Some(&"tee") {
                return self.genkey_pair(&words);
            }
            let key = Self::fake_key(self.next_key.fetch_add(1, Ordering::SeqCst));
            return CommandOutput::ok(format!("{}\n", key));
        }

        match words.as_slice() {
            ["cat", paths @ ..] if !paths.is_empty() => {
                let files = lock(&self.files);
                let mut out = String::new();
                for path in paths {
                    match files.get(*path) {
                        Some(content) => out.push_str(content),
                        None => return CommandOutput::failed(1, "No such file or directory"),
                    }
                }
                CommandOutput::ok(out)
            }
            ["test", "-f", path, "&&", "echo", word] => {
                if lock(&self.files).contains_key(*path) {
                    CommandOutput::ok(format!("{}\n", word))
                } else {
                    CommandOutput::failed(1, "")
                }
            }
            ["ls", "-1", dir] => {
                let prefix = format!("{}/", dir.trim_end_matches('/'));
                let names: Vec<String> = lock(&self.files)
                    .keys()
                    .filter_map(|p| p.strip_prefix(&prefix))
                    .filter(|rest| !rest.contains('/'))
                    .map(str::to_string)
                    .collect();
                if names.is_empty() {
                    CommandOutput::failed(2, "No such file or directory")
                } else {
                    CommandOutput::ok(format!("{}\n", names.join("\n")))
                }
            }
            ["find", dir, rest @ ..] => {
                let pattern = rest
                    .iter()
                    .position(|w| *w == "-name")
                    .and_then(|i| rest.get(i + 1))
                    .copied()
                    .unwrap_or("*");
                let prefix = format!("{}/", dir.trim_end_matches('/'));
                let found: Vec<String> = lock(&self.files)
                    .keys()
                    .filter(|p| {
                        p.strip_prefix(&prefix)
                            .map(|name| !name.contains('/') && glob_match(pattern, name))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                let mut out = found.join("\n");
                if !out.is_empty() {
                    out.push('\n');
                }
                CommandOutput::ok(out)
            }
            ["rm", "-f", paths @ ..] => {
                let mut files = lock(&self.files);
                for path in paths {
                    files.remove(*path);
                }
                CommandOutput::ok("")
            }
            ["mkdir", "-p", _] => CommandOutput::ok(""),
            _ => CommandOutput::failed(127, "command not found"),
        }
    }

    fn genkey_pair(&self, words: &[&str]) -> CommandOutput {
        let key_path = words
            .iter()
            .position(|w| *w == "tee")
            .and_then(|i| words.get(i + 1));
        let pub_path = words
            .iter()
            .position(|w| *w == ">")
            .and_then(|i| words.get(i + 1));
        let (Some(key_path), Some(pub_path)) = (key_path, pub_path) else {
            return CommandOutput::failed(1, "usage");
        };
        let n = self.next_key.fetch_add(1, Ordering::SeqCst);
        let private = Self::fake_key(n);
        let public = Self::fake_key(n.wrapping_add(128));
        let mut files = lock(&self.files);
        files.insert(key_path.to_string(), format!("{}\n", private));
        files.insert(pub_path.to_string(), format!("{}\n", public));
        CommandOutput::ok(format!("{}\n{}\n", private, public))
    }
}

impl RemoteShell for ScriptedShell {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    fn exec(&self, command: &str) -> Result<CommandOutput> {
        lock(&self.commands).push(command.to_string());
        if lock(&self.broken).iter().any(|p| command.contains(p.as_str())) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stream did not contain valid UTF-8",
            )));
        }
        if let Some(out) = self.heredoc(command) {
            return Ok(out);
        }
        {
            let mut effects = lock(&self.effects);
            let mut files = lock(&self.files);
            effects.retain(|(pattern, path, contents)| {
                if command.contains(pattern.as_str()) {
                    files.insert(path.clone(), contents.clone());
                    false
                } else {
                    true
                }
            });
        }
        Ok(self
            .scripted(command)
            .unwrap_or_else(|| self.builtin(command)))
    }

    fn exec_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        lock(&self.timeouts).push((command.to_string(), timeout));
        self.exec(command)
    }

    fn write_file(&self, path: &str, contents: &str, _mode: u32) -> Result<()> {
        lock(&self.commands).push(format!("upload {}", path));
        lock(&self.files).insert(path.to_string(), contents.to_string());
        Ok(())
    }
}

/// Forwards commands to a [`ScriptedShell`] but keeps the trait's default
/// heredoc `write_file`, the way a plain exec-only shell uploads files
pub struct ExecOnly(pub Arc<ScriptedShell>);

impl RemoteShell for ExecOnly {
    fn host_id(&self) -> &str {
        self.0.host_id()
    }

    fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.0.exec(command)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Split a command into words, honouring single quotes
fn split_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut has_word = false;
    for c in command.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                has_word = true;
            }
            c if c.is_whitespace() && !in_quote => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        words.push(current);
    }
    words
}

/// `*`-only glob match
fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("wg0-peer*-client.conf", "wg0-peer12-client.conf"));
        assert!(!glob_match("wg0-peer*-client.conf", "wg1-peer1-client.conf"));
        assert!(glob_match("*-peer*-client.conf", "office-peer1-client.conf"));
        assert!(glob_match("*.conf", "wg0.conf"));
        assert!(!glob_match("*.conf", "wg0.key"));
    }

    #[test]
    fn test_split_words_quotes() {
        assert_eq!(
            split_words("cat '/root/a b.conf' 2>/dev/null"),
            vec!["cat", "/root/a b.conf", "2>/dev/null"]
        );
    }

    #[test]
    fn test_simulated_filesystem() {
        let shell = ScriptedShell::new("h");
        shell.with_file("/etc/wireguard/wg0.conf", "[Interface]\n");
        assert_eq!(
            shell.exec("ls -1 /etc/wireguard").unwrap().stdout,
            "wg0.conf\n"
        );
        assert!(shell
            .exec("test -f /etc/wireguard/wg0.conf && echo exists")
            .unwrap()
            .success());
        shell.exec("rm -f /etc/wireguard/wg0.conf").unwrap();
        assert!(shell.file("/etc/wireguard/wg0.conf").is_none());
        assert_eq!(shell.exec("wg show interfaces").unwrap().exit_code, 127);
    }

    #[test]
    fn test_rules_override_builtins() {
        let shell = ScriptedShell::new("h");
        shell.on_sequence(
            "kill -0",
            vec![CommandOutput::ok("alive"), CommandOutput::failed(1, "")],
        );
        assert!(shell.exec("kill -0 42").unwrap().success());
        assert!(!shell.exec("kill -0 42").unwrap().success());
        assert!(!shell.exec("kill -0 42").unwrap().success());
    }

    #[test]
    fn test_genkey_pipeline_writes_files() {
        let shell = ScriptedShell::new("h");
        let out = shell
            .exec("umask 077 && wg genkey | tee /d/wg0-peer1.key | wg pubkey > /d/wg0-peer1.pub && cat /d/wg0-peer1.key /d/wg0-peer1.pub")
            .unwrap();
        assert_eq!(out.stdout.lines().count(), 2);
        assert!(shell.file("/d/wg0-peer1.key").is_some());
        assert!(shell.file("/d/wg0-peer1.pub").is_some());
    }
}
