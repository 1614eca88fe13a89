//! Endpoint lifecycle: `Created` -> `Opened` -> `Closed`.

use {
    crate::{
        error::Error,
        utils::{Result, unpoison},
    },
    std::{fmt, sync::Mutex},
};

/// Lifecycle state of a server or client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    /// Built but never started.
    Created,
    /// Started and serving.
    Opened,
    /// Closed; terminal.
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointState::Created => "created",
            EndpointState::Opened => "opened",
            EndpointState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    /// A start is binding or connecting; reported as `Created`.
    Starting,
    Opened,
    Closed,
}

/// Serialises lifecycle transitions of one endpoint.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<Phase>);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(Mutex::new(Phase::Created))
    }

    pub(crate) fn get(&self) -> EndpointState {
        match *unpoison(self.0.lock()) {
            Phase::Created | Phase::Starting => EndpointState::Created,
            Phase::Opened => EndpointState::Opened,
            Phase::Closed => EndpointState::Closed,
        }
    }

    /// Claims the start sequence; fails unless the endpoint is `Created`.
    pub(crate) fn begin_open(&self) -> Result<()> {
        let mut phase = unpoison(self.0.lock());
        match *phase {
            Phase::Created => {
                *phase = Phase::Starting;
                Ok(())
            }
            Phase::Starting => Err(Error::state("endpoint is already starting")),
            Phase::Opened => Err(Error::state("cannot start an endpoint that is opened")),
            Phase::Closed => Err(Error::state("cannot start an endpoint that is closed")),
        }
    }

    pub(crate) fn finish_open(&self) {
        *unpoison(self.0.lock()) = Phase::Opened;
    }

    /// Returns to `Created` after a failed start.
    pub(crate) fn abort_open(&self) {
        *unpoison(self.0.lock()) = Phase::Created;
    }

    /// Checks that a close may proceed.
    ///
    /// Returns `Ok(false)` when the endpoint is already closed, which makes
    /// repeated closes a no-op.
    pub(crate) fn check_close(&self) -> Result<bool> {
        match *unpoison(self.0.lock()) {
            Phase::Created | Phase::Starting => {
                Err(Error::state("endpoint has not been started"))
            }
            Phase::Opened => Ok(true),
            Phase::Closed => Ok(false),
        }
    }

    pub(crate) fn set_closed(&self) {
        *unpoison(self.0.lock()) = Phase::Closed;
    }
}
