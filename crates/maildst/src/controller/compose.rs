//! Two exim instances driven through `docker compose`.
//!
//! Both MTAs run under libfaketime and read the simulated time from the
//! clock store, which compose mounts into the containers. Messages are
//! submitted with `exim -i -t` inside the sending container; queue depths
//! are probed with `exim -bpc`.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    time::Duration,
};

use super::{
    reset_dir, Controller, ControllerError, Environment, MailQueue, OutgoingMessage, StartContext,
};
use crate::{
    clock::{FileClockStore, Timestamp, VirtualClock},
    config::{EnvironmentConfig, SimulationConfig},
};

const FAKETIME_FORMAT: &str = "@%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct ComposeEnvironment {
    env: EnvironmentConfig,
    clock_store: PathBuf,
}

impl ComposeEnvironment {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            env: config.environment.clone(),
            clock_store: config.clock_store(),
        }
    }

    /// Writes the compose env file, then the clock store. The store is only
    /// created once nothing else can fail before a controller owns it.
    fn install_clock(&self, initial: Timestamp) -> Result<VirtualClock, ControllerError> {
        let env_file = self.env.env_file();
        let faketime = initial.format(FAKETIME_FORMAT);
        fs::write(&env_file, format!("FAKETIME={faketime}\n"))
            .map_err(ControllerError::io(&env_file))?;

        if let Some(parent) = self.clock_store.parent() {
            fs::create_dir_all(parent).map_err(ControllerError::io(parent))?;
        }
        Ok(VirtualClock::new(FileClockStore::create(&self.clock_store, initial)?))
    }

    fn prepare(&self) -> Result<(), ControllerError> {
        let mail_dir = self.env.artifact_dir();
        if let Err(err) = reset_dir(&mail_dir) {
            tracing::warn!(%err, "Need sudo permissions to reset mail directory");
            sudo(&["rm", "-R", &mail_dir.to_string_lossy()])?;
            fs::create_dir_all(&mail_dir).map_err(ControllerError::io(&mail_dir))?;
        }
        let owner = self.env.mail_owner.to_string();
        chown_or_sudo(&mail_dir, self.env.mail_owner, self.env.mail_owner, &owner)?;
        // exim refuses configs not owned by root
        for config in &self.env.root_owned_configs {
            let path = self.env.resolve(config);
            chown_or_sudo(&path, 0, 0, "root:root")?;
        }
        Ok(())
    }
}

impl Environment for ComposeEnvironment {
    fn start(&self, ctx: &StartContext<'_>) -> Result<Box<dyn Controller>, ControllerError> {
        self.prepare()?;
        let clock = self.install_clock(ctx.initial_time)?;

        let controller = ComposeController {
            env: self.env.clone(),
            clock,
            artifact_dir: self.env.artifact_dir(),
        };

        tracing::info!(seed = ctx.seed, "Starting compose services");
        if let Err(err) = controller.up() {
            if let Err(cleanup) = controller.teardown() {
                tracing::warn!(%cleanup, "Cleanup after failed start did not complete");
            }
            return Err(err);
        }
        Ok(Box::new(controller))
    }

    fn artifact_dir(&self) -> PathBuf {
        self.env.artifact_dir()
    }

    fn snapshot_root(&self) -> PathBuf {
        self.env.snapshot_root()
    }
}

#[derive(Debug)]
pub struct ComposeController {
    env: EnvironmentConfig,
    clock: VirtualClock,
    artifact_dir: PathBuf,
}

impl ComposeController {
    fn compose(&self, args: &[&str]) -> Command {
        let mut command = Command::new("docker");
        command
            .arg("compose")
            .args(args)
            .current_dir(&self.env.project_dir);
        command
    }

    fn run(&self, args: &[&str]) -> Result<String, ControllerError> {
        let output = self
            .compose(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ControllerError::Spawn {
                command: display_command(args),
                source,
            })?;
        check_output(args, output)
    }

    fn up(&self) -> Result<(), ControllerError> {
        self.run(&[
            "up",
            "--detach",
            "--wait",
            "--build",
            "--force-recreate",
            "--quiet-pull",
        ])?;
        let running = self.run(&["ps", "--services", "--status", "running"])?;
        let running: Vec<&str> = running.lines().map(str::trim).collect();
        tracing::info!(services = ?running, "Compose services running");
        for service in [&self.env.send_service, &self.env.receive_service] {
            if !running.contains(&service.as_str()) {
                return Err(ControllerError::Setup(format!(
                    "service {service} is not running"
                )));
            }
        }
        Ok(())
    }

    fn service(&self, queue: MailQueue) -> &str {
        match queue {
            MailQueue::Send => &self.env.send_service,
            MailQueue::Receive => &self.env.receive_service,
        }
    }
}

impl Controller for ComposeController {
    fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    fn submit_message(&self, message: &OutgoingMessage) -> Result<(), ControllerError> {
        let args = ["exec", "-T", self.env.send_service.as_str(), "exim", "-i", "-t"];
        let mut child = self
            .compose(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ControllerError::Spawn {
                command: display_command(&args),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.raw.as_bytes())
                .map_err(|source| ControllerError::Spawn {
                    command: display_command(&args),
                    source,
                })?;
        }
        let output = child
            .wait_with_output()
            .map_err(|source| ControllerError::Spawn {
                command: display_command(&args),
                source,
            })?;
        check_output(&args, output)?;
        tracing::debug!(
            recipient = %message.recipient,
            subject = %message.subject,
            "Submitted message to sending MTA"
        );
        Ok(())
    }

    fn queue_depth(&self, queue: MailQueue) -> Result<usize, ControllerError> {
        let args = ["exec", "-T", self.service(queue), "exim", "-bpc"];
        let output = self.run(&args)?;
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        let depth = trimmed.parse::<usize>().map_err(|_| ControllerError::Output {
            command: display_command(&args),
            output: trimmed.to_owned(),
        })?;
        tracing::trace!(%queue, depth, "Probed queue depth");
        Ok(depth)
    }

    fn queue_poll_interval(&self) -> Duration {
        self.env.queue_poll_interval()
    }

    fn teardown(&self) -> Result<(), ControllerError> {
        tracing::info!("Stopping compose services");
        let down = self.run(&["down", "--volumes"]).map(drop);
        let env_file = self.env.env_file();
        let env = match fs::remove_file(&env_file) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                Err(ControllerError::io(&env_file)(err))
            }
            _ => Ok(()),
        };
        let clock = self.clock.remove().map_err(ControllerError::from);
        down.and(env).and(clock)?;
        tracing::info!("Environment cleanup completed");
        Ok(())
    }
}

fn display_command(args: &[&str]) -> String {
    format!("docker compose {}", args.join(" "))
}

fn check_output(args: &[&str], output: Output) -> Result<String, ControllerError> {
    if !output.status.success() {
        return Err(ControllerError::Command {
            command: display_command(args),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn sudo(args: &[&str]) -> Result<(), ControllerError> {
    let output = Command::new("sudo")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ControllerError::Spawn {
            command: format!("sudo {}", args.join(" ")),
            source,
        })?;
    if !output.status.success() {
        return Err(ControllerError::Command {
            command: format!("sudo {}", args.join(" ")),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn chown_or_sudo(path: &Path, uid: u32, gid: u32, owner: &str) -> Result<(), ControllerError> {
    match std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::warn!(?path, "Need sudo permissions to change ownership");
            sudo(&["chown", owner, &path.to_string_lossy()])
        }
        Err(err) => Err(ControllerError::io(path)(err)),
    }
}

#[cfg(not(unix))]
fn chown_or_sudo(_path: &Path, _uid: u32, _gid: u32, _owner: &str) -> Result<(), ControllerError> {
    Ok(())
}
