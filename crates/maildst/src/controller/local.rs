//! In-process environment with loopback delivery.
//!
//! A submitted message is written straight to its delivery path, so both
//! queues always read empty. Used for dry runs of the engine and in tests.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{
    delivery_path, reset_dir, Controller, ControllerError, Environment, MailQueue,
    OutgoingMessage, StartContext,
};
use crate::{
    clock::{FileClockStore, VirtualClock},
    config::SimulationConfig,
};

#[derive(Debug, Clone)]
pub struct LocalEnvironment {
    artifact_dir: PathBuf,
    snapshot_root: PathBuf,
    clock_store: PathBuf,
    queue_poll: Duration,
}

impl LocalEnvironment {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            artifact_dir: config.environment.artifact_dir(),
            snapshot_root: config.environment.snapshot_root(),
            clock_store: config.clock_store(),
            queue_poll: config.environment.queue_poll_interval(),
        }
    }
}

impl Environment for LocalEnvironment {
    fn start(&self, ctx: &StartContext<'_>) -> Result<Box<dyn Controller>, ControllerError> {
        reset_dir(&self.artifact_dir)?;
        if let Some(parent) = self.clock_store.parent() {
            fs::create_dir_all(parent).map_err(ControllerError::io(parent))?;
        }
        let clock = VirtualClock::new(FileClockStore::create(&self.clock_store, ctx.initial_time)?);
        tracing::debug!(seed = ctx.seed, clock = %clock.location(), "Started local environment");
        Ok(Box::new(LocalController {
            clock,
            artifact_dir: self.artifact_dir.clone(),
            queue_poll: self.queue_poll,
        }))
    }

    fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir.clone()
    }

    fn snapshot_root(&self) -> PathBuf {
        self.snapshot_root.clone()
    }
}

#[derive(Debug)]
pub struct LocalController {
    clock: VirtualClock,
    artifact_dir: PathBuf,
    queue_poll: Duration,
}

impl Controller for LocalController {
    fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    fn submit_message(&self, message: &OutgoingMessage) -> Result<(), ControllerError> {
        let path = delivery_path(&self.artifact_dir, &message.recipient, &message.subject);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ControllerError::io(parent))?;
        }
        fs::write(&path, &message.raw).map_err(ControllerError::io(&path))?;
        tracing::debug!(?path, "Delivered message locally");
        Ok(())
    }

    fn queue_depth(&self, _queue: MailQueue) -> Result<usize, ControllerError> {
        Ok(0)
    }

    fn stages_messages(&self) -> bool {
        false
    }

    fn queue_poll_interval(&self) -> Duration {
        self.queue_poll
    }

    fn teardown(&self) -> Result<(), ControllerError> {
        self.clock.remove()?;
        Ok(())
    }
}
