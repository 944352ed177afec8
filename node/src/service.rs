//! Start/stop bookkeeping shared by the long-lived services.

use crate::error::ServiceError;
use parking_lot::Mutex;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Created => "created",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A service is started at most once and stopped at most once. Every
/// transition is checked so that a second start or a stop before start
/// fails instead of running the hooks again.
pub struct BaseService {
    name: &'static str,
    state: Mutex<ServiceState>,
}

impl BaseService {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ServiceState::Created),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn begin_start(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        match *state {
            ServiceState::Created => {
                *state = ServiceState::Starting;
                info!(service = self.name, "starting");
                Ok(())
            }
            ServiceState::Stopping | ServiceState::Stopped => {
                Err(ServiceError::AlreadyStopped(self.name))
            }
            _ => Err(ServiceError::AlreadyStarted(self.name)),
        }
    }

    /// Completes a start. A failed start ends in `Stopped`, never `Running`.
    pub fn finish_start(&self, ok: bool) {
        let mut state = self.state.lock();
        *state = if ok {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        };
    }

    pub fn begin_stop(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        match *state {
            ServiceState::Running => {
                *state = ServiceState::Stopping;
                info!(service = self.name, "stopping");
                Ok(())
            }
            ServiceState::Stopping | ServiceState::Stopped => {
                Err(ServiceError::AlreadyStopped(self.name))
            }
            _ => Err(ServiceError::NotRunning(self.name)),
        }
    }

    pub fn finish_stop(&self) {
        *self.state.lock() = ServiceState::Stopped;
        info!(service = self.name, "stopped");
    }
}
