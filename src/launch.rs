//! Running launcher commands through the configured shell.

use std::{
    env,
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    path::Path,
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LaunchKeys;
use crate::env_state::{EnvMap, EnvState};
use crate::types::Launcher;

#[cfg(windows)]
const SHELL_FLAG: &str = "/c";
#[cfg(not(windows))]
const SHELL_FLAG: &str = "-c";

#[cfg(windows)]
const FALLBACK_SHELL: &str = "cmd";
#[cfg(not(windows))]
const FALLBACK_SHELL: &str = "/bin/sh";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launcher {0} is disabled")]
    Disabled(String),
    #[error("launcher {0} has no versions")]
    NoVersions(String),
    #[error("nothing to run")]
    EmptyCommand,
    #[error("failed to start {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },
}

/// Escapes stream redirections so the shell passes them through verbatim.
pub fn escape_redirects(command: &str) -> String {
    #[cfg(windows)]
    let (gt, lt) = ("^^^>", "^^^<");
    #[cfg(not(windows))]
    let (gt, lt) = ("\\>", "\\<");
    command.replace('>', gt).replace('<', lt)
}

/// Shell program named by the variable `keys.shell`, falling back to the
/// platform shell.
pub fn resolve_shell(vars: &EnvMap, keys: &LaunchKeys) -> String {
    vars.get(&keys.shell)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(FALLBACK_SHELL)
        .to_string()
}

/// Package name of an install root: the second-to-last path component.
fn package_name(root: &Path) -> Option<String> {
    root.iter()
        .rev()
        .nth(1)
        .map(|name| name.to_string_lossy().into_owned())
}

/// Drops path-list entries under package roots whose package is not in
/// `keys.inherit`, so launched commands do not see other packages' paths.
pub fn scrub_package_roots(vars: &mut EnvMap, keys: &LaunchKeys) {
    let Some(roots) = keys
        .package_roots
        .as_ref()
        .and_then(|name| vars.get(name))
        .cloned()
    else {
        return;
    };

    let hidden = env::split_paths(&roots)
        .filter(|root| !root.as_os_str().is_empty())
        .filter(|root| match package_name(root) {
            Some(name) => !keys.inherit.contains(&name),
            None => true,
        })
        .map(|root| root.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    if hidden.is_empty() {
        return;
    }

    for value in vars.values_mut() {
        let entries = env::split_paths(value.as_str()).collect::<Vec<_>>();
        let kept = entries
            .iter()
            .filter(|entry| {
                let entry = entry.to_string_lossy();
                !hidden.iter().any(|root| entry.starts_with(root.as_str()))
            })
            .collect::<Vec<_>>();
        if kept.len() == entries.len() {
            continue;
        }
        match env::join_paths(kept) {
            Ok(joined) => *value = joined.to_string_lossy().into_owned(),
            Err(err) => warn!(error = %err, "failed to rebuild path list"),
        }
    }
    debug!(roots = ?hidden, "hid package roots from launch environment");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStep {
    Previous,
    Next,
}

/// Moves `current` one step through `count` versions, wrapping at both ends.
pub fn cycle_version(current: usize, count: usize, step: VersionStep) -> usize {
    if count == 0 {
        return 0;
    }
    let current = current.min(count - 1);
    match step {
        VersionStep::Previous if current == 0 => count - 1,
        VersionStep::Previous => current - 1,
        VersionStep::Next => (current + 1) % count,
    }
}

/// Command of the `index`-th version of `launcher`, in version-name order.
pub fn launcher_command(launcher: &Launcher, index: usize) -> Result<&str, LaunchError> {
    if !launcher.enabled {
        return Err(LaunchError::Disabled(launcher.name.clone()));
    }
    let count = launcher.vdata.len();
    let version = launcher
        .vdata
        .values()
        .nth(index.min(count.saturating_sub(1)))
        .ok_or_else(|| LaunchError::NoVersions(launcher.name.clone()))?;
    let command = version.command.trim();
    if command.is_empty() {
        return Err(LaunchError::EmptyCommand);
    }
    Ok(command)
}

/// Receives a launched command's output.
pub trait OutputSink: Send + Sync + 'static {
    fn line(&self, line: String);
    fn exited(&self, code: Option<i32>);
}

pub struct ProcessLauncher {
    env: EnvState,
    keys: LaunchKeys,
}

impl ProcessLauncher {
    pub fn new(env: EnvState, keys: LaunchKeys) -> Self {
        Self { env, keys }
    }

    /// Builds the shell invocation for `command` with the scrubbed
    /// environment snapshot.
    pub fn prepare(&self, command: &str) -> Result<(String, Command), LaunchError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        let mut vars = self.env.snapshot();
        scrub_package_roots(&mut vars, &self.keys);
        let shell = resolve_shell(&vars, &self.keys);

        let mut process = Command::new(&shell);
        process
            .arg(SHELL_FLAG)
            .arg(escape_redirects(command))
            .env_clear()
            .envs(vars.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok((shell, process))
    }

    /// Starts `command` and streams its merged output to `sink` from
    /// background threads. Returns the child's pid.
    pub fn spawn(&self, command: &str, sink: Arc<dyn OutputSink>) -> Result<u32, LaunchError> {
        let (shell, mut process) = self.prepare(command)?;
        let mut child = process
            .spawn()
            .map_err(|source| LaunchError::Spawn { shell: shell.clone(), source })?;
        let pid = child.id();
        info!(pid, %shell, command, "launched command");

        let readers = [
            child.stdout.take().map(|out| pump_lines(out, Arc::clone(&sink))),
            child.stderr.take().map(|err| pump_lines(err, Arc::clone(&sink))),
        ];
        let waiter = thread::Builder::new()
            .name(format!("launch-{pid}"))
            .spawn(move || {
                for reader in readers.into_iter().flatten() {
                    let _ = reader.join();
                }
                sink.exited(wait_code(&mut child));
            });
        if let Err(err) = waiter {
            warn!(pid, error = %err, "failed to watch launched command");
        }
        Ok(pid)
    }
}

fn wait_code(child: &mut Child) -> Option<i32> {
    match child.wait() {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(error = %err, "failed to wait for launched command");
            None
        }
    }
}

fn pump_lines<R>(stream: R, sink: Arc<dyn OutputSink>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => sink.line(console_line(&buffer)),
                Err(err) => {
                    debug!(error = %err, "output stream closed");
                    break;
                }
            }
        }
    })
}

/// Decodes one raw output line. A carriage return rewrites the line, so only
/// the text after the last one is kept.
pub fn console_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\n', '\r']);
    match text.rsplit_once('\r') {
        Some((_, last)) => last.to_string(),
        None => text.to_string(),
    }
}
