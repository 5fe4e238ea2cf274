use crate::config::SupervisorConfig;
use crate::error::{Result, VigilError};
use crate::supervisor::InstanceId;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Metadata returned when spawning one instance
#[derive(Debug)]
pub struct SpawnedInstance {
    /// The child process handle, stdout/stderr piped
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,
}

/// Spawn one worker instance of the managed script.
///
/// Runs the script under the configured interpreter (or directly when no
/// interpreter is set), with the merged environment for this instance,
/// the configured working directory, and piped stdout/stderr for log
/// capture.
pub async fn spawn_instance(
    config: &SupervisorConfig,
    instance_id: InstanceId,
    production: bool,
) -> Result<SpawnedInstance> {
    let script = resolve_against_cwd(&config.script, config.cwd.as_deref());
    if !script.exists() {
        return Err(VigilError::ScriptNotFound(script));
    }

    let mut command = match &config.interpreter {
        Some(interpreter) => {
            let interpreter = resolve_against_cwd(interpreter, config.cwd.as_deref());
            if !interpreter.exists() {
                return Err(VigilError::InterpreterNotFound(interpreter));
            }
            let mut c = Command::new(interpreter);
            c.arg(&script);
            c
        }
        None => Command::new(&script),
    };

    if !config.args.is_empty() {
        command.args(&config.args);
    }

    if let Some(ref cwd) = config.cwd {
        command.current_dir(cwd);
    }

    for (key, value) in config.merged_env(production, instance_id) {
        command.env(key, value);
    }

    // Capture stdout and stderr as pipes for log aggregation
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let child = command
        .spawn()
        .map_err(|e| VigilError::SpawnError(instance_id, e.to_string()))?;

    let pid = child.id().ok_or_else(|| {
        VigilError::SpawnError(instance_id, "process exited before PID was read".to_string())
    })?;

    Ok(SpawnedInstance { child, pid })
}

/// Resolve a relative path against the instance's working directory,
/// so it is checked (and executed) where the child will actually run.
fn resolve_against_cwd(path: &Path, cwd: Option<&Path>) -> PathBuf {
    match cwd {
        Some(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    }
}
