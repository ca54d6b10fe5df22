//! Operation state machine.
//!
//! ```text
//! NotStarted ──▶ Scanning ──▶ Encoding ◀──▶ Paused
//!      │            │            │            │
//!      │            ▼            ▼            ▼
//!      │         Finished ◀── Stopping ◀──────┘
//!      └──────────▶ Finished (start failure, crash from any live state)
//! ```
//!
//! `Finished` is terminal. Entering it goes through [`StateMachine::finish`],
//! which succeeds for exactly one caller, so concurrent failure paths (a
//! failed ping racing a failed call) produce a single report.

use tokio::sync::watch;

use vidrelay_core::{OperationState, RelayError, Result};

/// A control command from the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Stop,
}

impl Control {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }
}

/// Whether `from → to` is a legal transition.
pub fn can_transition(from: OperationState, to: OperationState) -> bool {
    use OperationState::*;
    matches!(
        (from, to),
        (NotStarted, Scanning)
            | (NotStarted, Finished)
            | (Scanning, Encoding)
            | (Scanning, Stopping)
            | (Scanning, Finished)
            | (Encoding, Paused)
            | (Encoding, Stopping)
            | (Encoding, Finished)
            | (Paused, Encoding)
            | (Paused, Stopping)
            | (Paused, Finished)
            | (Stopping, Finished)
    )
}

/// Decide what a control command does in `state`.
///
/// `Ok(Some(next))` means send the command and move to `next`, `Ok(None)`
/// means the command is a no-op, and `Err` means it is rejected.
pub fn plan(control: Control, state: OperationState) -> Result<Option<OperationState>> {
    use OperationState::*;
    match (control, state) {
        (Control::Pause, Encoding) => Ok(Some(Paused)),
        (Control::Pause, Paused) => Ok(None),
        (Control::Resume, Paused) => Ok(Some(Encoding)),
        (Control::Resume, Encoding) => Ok(None),
        (Control::Stop, Scanning | Encoding | Paused) => Ok(Some(Stopping)),
        (Control::Stop, NotStarted | Stopping | Finished) => Ok(None),
        (control, state) => Err(RelayError::invalid_state(control.name(), state)),
    }
}

/// The single live state of one operation.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<OperationState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(OperationState::NotStarted);
        Self { tx }
    }

    pub fn state(&self) -> OperationState {
        *self.tx.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.tx.subscribe()
    }

    /// Move to `to`. Returns the previous state.
    ///
    /// Entering `Finished` this way is allowed but [`finish`] should be
    /// preferred wherever more than one path can end the operation.
    ///
    /// [`finish`]: StateMachine::finish
    pub fn transition(&self, to: OperationState) -> Result<OperationState> {
        let mut previous = OperationState::NotStarted;
        let mut rejected = None;
        self.tx.send_if_modified(|current| {
            previous = *current;
            if can_transition(*current, to) {
                *current = to;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });
        match rejected {
            Some(state) => Err(RelayError::invalid_state(format!("move to {to}"), state)),
            None => Ok(previous),
        }
    }

    /// Enter `Finished`. Returns true only for the caller that ended the
    /// operation.
    pub fn finish(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == OperationState::Finished {
                false
            } else {
                *current = OperationState::Finished;
                true
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.state() == OperationState::Finished
    }

    /// Wait until the operation is finished.
    pub async fn wait_finished(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == OperationState::Finished).await;
    }
}
