use std::{ffi::OsStr, io, path::PathBuf, process::Output};

use tokio::process::Command;

#[derive(Debug)]
pub(crate) enum ShellFailure {
    NotFound(String),
    Io(String),
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

/// A device tool, optionally run through an interpreter (`sh script.sh`).
#[derive(Clone, Debug)]
pub(crate) struct Tool {
    program: PathBuf,
    leading: Vec<String>,
}

impl Tool {
    pub(crate) fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading: Vec::new(),
        }
    }

    fn from_env(env_key: &str, default: &str) -> Self {
        Self::new(std::env::var(env_key).unwrap_or_else(|_| default.to_string()))
    }

    pub(crate) fn pm() -> Self {
        Self::from_env("PI_PM_PATH", "pm")
    }

    pub(crate) fn appops() -> Self {
        Self::from_env("PI_APPOPS_PATH", "appops")
    }

    #[cfg(test)]
    pub(crate) fn script(path: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("sh"),
            leading: vec![path.into()],
        }
    }

    pub(crate) async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String, ShellFailure> {
        let mut full: Vec<&str> = self.leading.iter().map(String::as_str).collect();
        full.extend(args.iter().map(|arg| arg.as_ref()));
        shell_stdout(self.program.clone(), &full).await
    }
}

pub(crate) async fn shell_output<S: AsRef<OsStr>>(
    program: PathBuf,
    args: &[S],
) -> Result<Output, ShellFailure> {
    let mut cmd = Command::new(&program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    let output = cmd.output().await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ShellFailure::NotFound(program.display().to_string())
        } else {
            ShellFailure::Io(e.to_string())
        }
    })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(ShellFailure::Exit {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub(crate) async fn shell_stdout<S: AsRef<OsStr>>(
    program: PathBuf,
    args: &[S],
) -> Result<String, ShellFailure> {
    let output = shell_output(program, args).await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub(crate) fn format_shell_output(stdout: &str, stderr: &str) -> String {
    [stdout.trim(), stderr.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn shell_failure_message(err: &ShellFailure) -> String {
    match err {
        ShellFailure::NotFound(program) => format!("{program} not found"),
        ShellFailure::Io(msg) => msg.clone(),
        ShellFailure::Exit {
            status,
            stdout,
            stderr,
        } => {
            let detail = format_shell_output(stdout, stderr);
            if detail.is_empty() {
                format!("command failed with exit {status}")
            } else {
                format!("command failed with exit {status}: {detail}")
            }
        }
    }
}

pub(crate) fn shell_failure_status(err: ShellFailure) -> tonic::Status {
    match &err {
        ShellFailure::NotFound(_) => tonic::Status::failed_precondition(shell_failure_message(&err)),
        ShellFailure::Io(_) => tonic::Status::internal(shell_failure_message(&err)),
        ShellFailure::Exit { .. } => tonic::Status::aborted(shell_failure_message(&err)),
    }
}
