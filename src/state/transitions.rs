//! Transitions for the replica processor state machine.
//!
//! Pure functions for computing the next state from the current state, a
//! command, and the number of open work-item scopes. The stateful wrapper in
//! [`super::replica`] applies these under its lock.
//!
//! ```text
//!                MarkInitializingDone          Start
//! Initializing ───────────────────────► Stopped ─────► Working
//!                                          ▲  ▲           │
//!                     RequestStop (idle)   │  │           │ RequestStop (scopes open)
//!                  ◄───────────────────────┘  │           ▼
//!                                             └──────── Stopping
//!                                           last scope closed
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The processing state of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorState {
    /// The replica is starting up and has not finished initialization.
    Initializing,
    /// No work may start and none is in flight.
    Stopped,
    /// Work items may be admitted.
    Working,
    /// A drain was requested; in-flight work is finishing, no new work starts.
    Stopping,
}

impl ProcessorState {
    /// Returns the state's name as persisted and reported over HTTP.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorState::Initializing => "Initializing",
            ProcessorState::Stopped => "Stopped",
            ProcessorState::Working => "Working",
            ProcessorState::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to change the processor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCommand {
    /// Start-up finished; the replica may be started.
    MarkInitializingDone,
    /// Begin admitting work.
    Start,
    /// Stop admitting work and let in-flight scopes finish.
    RequestStopAndDrain,
    /// A scope closed; `open_scopes` is the count after closing.
    ScopeClosed,
}

/// Error returned when a command is not valid in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// `MarkInitializingDone` was called after initialization already finished.
    #[error("initialization already completed (current state: {current})")]
    AlreadyInitialized { current: ProcessorState },

    /// The command requires initialization to have finished.
    #[error("{command:?} is not allowed before initialization completes")]
    NotInitialized { command: StateCommand },
}

/// Computes the state that results from applying `command`.
///
/// `open_scopes` is the number of work-item scopes open at the time the
/// command is applied (after the closing scope was removed, for
/// [`StateCommand::ScopeClosed`]).
///
/// Commands that do not change anything return the current state; callers
/// compare old and new to decide whether to persist.
pub fn next_state(
    current: ProcessorState,
    command: StateCommand,
    open_scopes: usize,
) -> Result<ProcessorState, TransitionError> {
    use ProcessorState::*;
    use StateCommand::*;

    match (current, command) {
        (Initializing, MarkInitializingDone) => Ok(Stopped),
        (state, MarkInitializingDone) => Err(TransitionError::AlreadyInitialized { current: state }),

        (Initializing, command @ (Start | RequestStopAndDrain)) => {
            Err(TransitionError::NotInitialized { command })
        }

        (Stopped, Start) => Ok(Working),
        // Starting again is harmless; a drain in progress is not interrupted.
        (state @ (Working | Stopping), Start) => Ok(state),

        (Working, RequestStopAndDrain) if open_scopes == 0 => Ok(Stopped),
        (Working, RequestStopAndDrain) => Ok(Stopping),
        (state @ (Stopped | Stopping), RequestStopAndDrain) => Ok(state),

        (Stopping, ScopeClosed) if open_scopes == 0 => Ok(Stopped),
        (state, ScopeClosed) => Ok(state),
    }
}
