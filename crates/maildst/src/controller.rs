//! The narrow interface through which actions reach the system under test.
//!
//! A [`Controller`] owns one run's environment: the virtual clock, the
//! artifact directory and the two MTA queues. An [`Environment`] creates a
//! fresh controller for every run.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    clock::{ClockError, Timestamp, VirtualClock},
    config::{EnvironmentKind, SimulationConfig},
    rng::SimulationRng,
};

mod compose;
mod local;

pub use compose::{ComposeController, ComposeEnvironment};
pub use local::{LocalController, LocalEnvironment};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unexpected output from `{command}`: {output:?}")]
    Output { command: String, output: String },
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("environment setup failed: {0}")]
    Setup(String),
}

impl ControllerError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// The MTA whose queue is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailQueue {
    Send,
    Receive,
}

impl std::fmt::Display for MailQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// A message ready to be handed to the sending MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub recipient: String,
    pub subject: String,
    /// Full RFC 5322 text, headers included.
    pub raw: String,
}

/// Path a delivered message ends up at:
/// `<artifact_dir>/<recipient>/<sanitized subject>.eml`.
pub fn delivery_path(artifact_dir: &Path, recipient: &str, subject: &str) -> PathBuf {
    artifact_dir
        .join(recipient)
        .join(format!("{}.eml", sanitize_subject(subject)))
}

/// Replaces characters that are not valid in file names with `_`.
pub fn sanitize_subject(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\\' => '_',
            c => c,
        })
        .collect()
}

pub trait Controller: Send + Sync {
    fn clock(&self) -> &VirtualClock;

    /// Directory the receiving side delivers into.
    fn artifact_dir(&self) -> &Path;

    fn submit_message(&self, message: &OutgoingMessage) -> Result<(), ControllerError>;

    fn queue_depth(&self, queue: MailQueue) -> Result<usize, ControllerError>;

    /// Whether submitted messages pass through the MTA queues before they
    /// are delivered. A loopback controller delivers on submission.
    fn stages_messages(&self) -> bool {
        true
    }

    /// Backoff between two queue depth probes.
    fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    /// Stops the services and deletes the clock store.
    fn teardown(&self) -> Result<(), ControllerError>;

    fn get_time(&self) -> Result<Timestamp, ControllerError> {
        Ok(self.clock().get()?)
    }

    fn set_time(&self, ts: Timestamp) -> Result<(), ControllerError> {
        Ok(self.clock().set(ts)?)
    }

    /// Advances simulated time by a uniform draw in `[lower_ms, upper_ms]`.
    fn advance_time(
        &self,
        rng: &SimulationRng,
        lower_ms: u64,
        upper_ms: u64,
    ) -> Result<Timestamp, ControllerError> {
        let by = rng.gen_millis(lower_ms, upper_ms.max(lower_ms));
        Ok(self.clock().advance(by)?)
    }

    /// Blocks until `queue` holds exactly `depth` messages or `timeout` expires.
    fn wait_for_queue_depth(
        &self,
        queue: MailQueue,
        depth: usize,
        timeout: Duration,
    ) -> Result<(), ControllerError> {
        let started = Instant::now();
        loop {
            let current = self.queue_depth(queue)?;
            if current == depth {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ControllerError::Timeout {
                    what: format!("{queue} queue depth {depth} (last seen {current})"),
                    waited,
                });
            }
            thread::sleep(self.queue_poll_interval());
        }
    }
}

/// Inputs an environment needs to bring up one run.
pub struct StartContext<'a> {
    pub seed: u64,
    pub initial_time: Timestamp,
    pub rng: &'a SimulationRng,
}

/// Factory for per-run controllers.
pub trait Environment: Send + Sync {
    /// Prepares directories, creates the clock store at `initial_time` and
    /// starts the services. On error nothing is left running.
    fn start(&self, ctx: &StartContext<'_>) -> Result<Box<dyn Controller>, ControllerError>;

    /// Directory a run's artifacts are delivered to.
    fn artifact_dir(&self) -> PathBuf;

    fn snapshot_root(&self) -> PathBuf;
}

/// Builds the environment selected by `config`.
pub fn environment_from_config(config: &SimulationConfig) -> Arc<dyn Environment> {
    match config.environment.kind {
        EnvironmentKind::Compose => Arc::new(ComposeEnvironment::new(config)),
        EnvironmentKind::Local => Arc::new(LocalEnvironment::new(config)),
    }
}

/// Removes every entry of `dir`, creating it if missing.
pub(crate) fn reset_dir(dir: &Path) -> Result<(), ControllerError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(ControllerError::io(dir)(err)),
    }
    std::fs::create_dir_all(dir).map_err(ControllerError::io(dir))
}
