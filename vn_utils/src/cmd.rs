use std::ffi::OsStr;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[derive(Error, Debug)]
pub enum CmdError {
    #[error("failed to spawn `{cmd}`: {err}")]
    Spawn { cmd: String, err: std::io::Error },
    #[error("command `{cmd}` failed with exit code {code}: {stderr}")]
    Failed {
        cmd: String,
        code: i32,
        stderr: String,
    },
    #[error("command `{cmd}` was killed by a signal")]
    Killed { cmd: String },
}

/// Runs the specified command and returns error on failure.
pub async fn run_cmd<I, S>(cmd: &str, args: I) -> Result<(), CmdError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_cmd_out(cmd, args).await.map(|_| ())
}

/// Runs the specified command and returns its stdout.
pub async fn run_cmd_out<I, S>(cmd: &str, args: I) -> Result<String, CmdError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(cmd);
    command.args(args);
    info!("Running command: `{:?}`", command);
    let output = command
        .output()
        .await
        .map_err(|err| CmdError::Spawn {
            cmd: format!("{command:?}"),
            err,
        })?;
    match output.status.code() {
        Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        Some(code) => Err(CmdError::Failed {
            cmd: format!("{command:?}"),
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        None => Err(CmdError::Killed {
            cmd: format!("{command:?}"),
        }),
    }
}
