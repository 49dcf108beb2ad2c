//! Acquisition state machine
//!
//! The run loop is the only writer; everyone else observes through a watch
//! channel. Transitions follow the crate's run lifecycle:
//!
//! ```text
//!   Idle ──► AcqStarting ──► AcqRunning ──► AcqStopping ──► Idle
//!     │                                         ▲
//!     ├──► McaStarting ──► McaRunning ──────────┘ (back to Idle)
//!     ├──► Rebooting ──► Idle
//!     └──► Terminated (kill)
//! ```

use serde::Serialize;

/// Position of the run loop in the acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RunState {
    /// Nothing active; the loop sleeps between polls.
    #[default]
    Idle,
    /// Opening the output file and starting the list-mode run.
    AcqStarting,
    /// List-mode run active, FIFOs being drained.
    AcqRunning,
    /// Stop requested; draining remainders and closing out.
    AcqStopping,
    /// Creating the MCA and starting the histogram run.
    McaStarting,
    /// Histogram run active, stepped once per second.
    McaRunning,
    /// Crate reboot in progress, waiting for operator acknowledgement.
    Rebooting,
    /// Run loop has exited; the process is shutting down.
    Terminated,
}

impl RunState {
    /// True while either list-mode acquisition or an MCA run is active.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            RunState::AcqStarting
                | RunState::AcqRunning
                | RunState::AcqStopping
                | RunState::McaStarting
                | RunState::McaRunning
        )
    }

    /// True while an MCA run is active.
    pub fn is_mca(&self) -> bool {
        matches!(self, RunState::McaStarting | RunState::McaRunning)
    }

    /// True while list-mode acquisition is active.
    pub fn is_acq(&self) -> bool {
        matches!(
            self,
            RunState::AcqStarting | RunState::AcqRunning | RunState::AcqStopping
        )
    }

    /// Check whether a transition to `target` is part of the lifecycle.
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, target),
            (Idle, AcqStarting)
                | (AcqStarting, AcqRunning)
                | (AcqStarting, Idle)          // start failed
                | (AcqRunning, AcqStopping)
                | (AcqStopping, Idle)
                | (Idle, McaStarting)
                | (McaStarting, McaRunning)
                | (McaStarting, Idle)          // MCA setup failed
                | (McaRunning, Idle)
                | (Idle, Rebooting)
                | (Rebooting, Idle)
                | (Idle, Terminated)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::AcqStarting => "AcqStarting",
            RunState::AcqRunning => "AcqRunning",
            RunState::AcqStopping => "AcqStopping",
            RunState::McaStarting => "McaStarting",
            RunState::McaRunning => "McaRunning",
            RunState::Rebooting => "Rebooting",
            RunState::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}
