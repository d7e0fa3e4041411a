//! Plugin process launcher
//!
//! Resolves a plugin reference on the filesystem to a runnable command and
//! spawns it with piped stdin/stdout, ready to be handed to
//! [`Host::start`](crate::Host::start).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::{LaunchConfig, StderrSink};
use crate::error::LaunchError;

const CARGO_MANIFEST: &str = "Cargo.toml";

/// A resolved plugin reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginReference {
    /// A prebuilt executable (binary or script)
    Executable(PathBuf),

    /// A local cargo package directory, run through `cargo run`
    CargoPackage(PathBuf),
}

impl PluginReference {
    /// Classify `reference`.
    ///
    /// Cargo packages are checked first, so a directory holding a
    /// `Cargo.toml` is run from source even if it is also executable.
    /// Only local paths are accepted; a `name@version` reference is never
    /// fetched and resolves to [`LaunchError::InvalidReference`].
    pub fn resolve(reference: impl AsRef<Path>, config: &LaunchConfig) -> Result<Self, LaunchError> {
        let reference = reference.as_ref();

        if let Some(dir) = cargo_package_dir(reference) {
            require_toolchain(&config.cargo_command)?;
            return Ok(Self::CargoPackage(dir));
        }

        if is_executable(reference) {
            let path = std::fs::canonicalize(reference)
                .map_err(|_| LaunchError::InvalidReference(reference.to_path_buf()))?;
            return Ok(Self::Executable(path));
        }

        Err(LaunchError::InvalidReference(reference.to_path_buf()))
    }

    /// Build the command that starts this plugin
    pub fn command(&self, config: &LaunchConfig) -> Command {
        let mut cmd = match self {
            Self::Executable(path) => Command::new(path),
            Self::CargoPackage(dir) => {
                let mut cmd = Command::new(&config.cargo_command);
                cmd.arg("run")
                    .arg("--quiet")
                    .arg("--manifest-path")
                    .arg(dir.join(CARGO_MANIFEST))
                    .args(&config.cargo_args)
                    .arg("--");
                cmd
            }
        };
        cmd.args(&config.args);

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// A spawned plugin process with its protocol pipes
pub struct PluginProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    stderr_sink: StderrSink,
}

impl PluginProcess {
    /// Spawn an arbitrary command as a plugin.
    ///
    /// This is the entry point for callers that locate plugins themselves;
    /// stdin and stdout are always piped, stderr follows `stderr_sink`.
    pub fn spawn(mut cmd: Command, stderr_sink: StderrSink) -> Result<Self, LaunchError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(match stderr_sink {
            StderrSink::Inherit => Stdio::inherit(),
            StderrSink::Null => Stdio::null(),
            StderrSink::Writer(_) => Stdio::piped(),
        });
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|source| LaunchError::Spawn { program, source })?;

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();

        tracing::info!(pid = ?child.id(), "Plugin process started");

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            stderr_sink,
        })
    }

    /// Get the process ID of the running plugin
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn into_parts(self) -> ProcessParts {
        ProcessParts {
            child: self.child,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            stderr_sink: self.stderr_sink,
        }
    }
}

pub(crate) struct ProcessParts {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
    pub stderr_sink: StderrSink,
}

/// Resolve `reference` and spawn it
pub fn launch(reference: impl AsRef<Path>, config: LaunchConfig) -> Result<PluginProcess, LaunchError> {
    let resolved = PluginReference::resolve(reference, &config)?;
    tracing::debug!(?resolved, "Launching plugin");

    let cmd = resolved.command(&config);
    PluginProcess::spawn(cmd, config.stderr)
}

fn cargo_package_dir(path: &Path) -> Option<PathBuf> {
    if path.is_dir() && path.join(CARGO_MANIFEST).is_file() {
        return Some(path.to_path_buf());
    }
    if path.is_file() && path.file_name().map(|n| n == CARGO_MANIFEST).unwrap_or(false) {
        return path.parent().map(|p| {
            if p.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                p.to_path_buf()
            }
        });
    }
    None
}

fn require_toolchain(command: &str) -> Result<(), LaunchError> {
    which::which(command).map(|_| ()).map_err(|_| LaunchError::ToolchainMissing {
        tool: command.to_string(),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "exe" | "bat" | "cmd"))
            .unwrap_or(false)
}
