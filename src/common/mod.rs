//! Types shared between the command loop and the run loop
//!
//! The two halves of the controller communicate three ways: one-shot operator
//! requests travel over a bounded channel ([`RunRequest`]), sticky modes live
//! in lock-free [`ControlFlags`], and the run loop publishes its state machine
//! position through a watch channel ([`RunState`]).

pub mod cli;
pub mod flags;
pub mod request;
pub mod state;

pub use cli::DaqArgs;
pub use flags::ControlFlags;
pub use request::{HardwareOp, ParamRange, RunRequest};
pub use state::RunState;

/// 32-bit data word, the native unit of the crate's FIFOs and files.
pub type Word = u32;
