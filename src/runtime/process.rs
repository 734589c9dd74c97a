//! Host process runtime
//!
//! Runs service commands as child processes of the supervisor. Output is
//! forwarded line by line to `tracing` under the service's name.

use super::{LaunchSpec, Runtime, ServiceProcess};
use crate::compose::config::CommandSpec;
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Runtime that launches processes on the host
#[derive(Debug, Clone, Default)]
pub struct ShellRuntime;

impl ShellRuntime {
    pub fn new() -> Self {
        Self
    }

    fn command(launch: &LaunchSpec, argv: &[String]) -> Result<Command> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            WardenError::Startup(format!("service {} has an empty command", launch.service))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &launch.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Runtime for ShellRuntime {
    async fn spawn(&self, launch: &LaunchSpec) -> Result<Box<dyn ServiceProcess>> {
        let mut cmd = Self::command(launch, &launch.argv)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            WardenError::Startup(format!(
                "failed to launch {} ({}): {}",
                launch.service,
                launch.argv.join(" "),
                e
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(launch.service.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(launch.service.clone(), "stderr", stderr);
        }

        tracing::debug!(
            "Launched {} with pid {}",
            launch.service,
            child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );

        Ok(Box::new(HostProcess {
            service: launch.service.clone(),
            child,
            exit_code: None,
        }))
    }

    async fn probe(&self, launch: &LaunchSpec, command: &CommandSpec) -> Result<bool> {
        let mut cmd = Self::command(launch, &command.to_argv())?;
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        let status = cmd.status().await.map_err(|e| {
            WardenError::HealthCheck(format!("failed to run probe for {}: {}", launch.service, e))
        })?;
        Ok(status.success())
    }
}

fn forward_output<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "warden::service", service = %service, stream, "{}", line);
        }
    });
}

/// Exit code of a finished process; death by signal maps to `128 + signal`
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// A child process of the supervisor
struct HostProcess {
    service: String,
    child: Child,
    exit_code: Option<i32>,
}

#[async_trait]
impl ServiceProcess for HostProcess {
    async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        let code = exit_code(status);
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn terminate(&mut self, grace: Duration) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        if let Some(pid) = self.child.id() {
            // SAFETY: pid belongs to a child we have not reaped yet
            let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if result < 0 {
                tracing::warn!(
                    "Failed to send SIGTERM to {} (pid {}): {}",
                    self.service,
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let code = exit_code(status?);
                self.exit_code = Some(code);
                Ok(code)
            }
            Err(_) => {
                tracing::warn!(
                    "{} did not stop within {:?}, killing it",
                    self.service,
                    grace
                );
                self.child.kill().await?;
                self.wait().await
            }
        }
    }
}
