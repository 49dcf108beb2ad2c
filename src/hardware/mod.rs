//! Hardware abstraction for the crate modules
//!
//! This module defines the contract the run controller consumes: boot and
//! parameter I/O, FIFO inspection and readout, list-mode and histogram run
//! control, and per-channel count-rate statistics. The vendor SDK binding
//! lives behind the same trait out of tree; in this crate the
//! [`EmulatedInterface`] stands in for real modules.

pub mod emulated;
pub mod params;

pub use emulated::EmulatedInterface;

use crate::common::Word;
use std::path::Path;
use thiserror::Error;

/// Hardware errors
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("interface used before booting the modules")]
    NotBooted,

    #[error("module {0} does not exist")]
    InvalidModule(u16),

    #[error("channel {channel} does not exist in module {module}")]
    InvalidChannel { module: u16, channel: u16 },

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("boot failed: {0}")]
    Boot(String),

    #[error("run control failed: {0}")]
    Run(String),

    #[error("FIFO read failed on module {module}: {reason}")]
    FifoRead { module: u16, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boot depth requested at initialization or reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Program every FPGA, download parameters, set DACs.
    Complete,
    /// Skip communication FPGA reprogramming for a faster turnaround.
    Fast,
}

/// Identification data reported by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub revision: u16,
    pub serial_number: u32,
    pub adc_bits: u16,
    pub adc_msps: u16,
}

/// Contract between the run controller and the crate hardware.
///
/// All methods are blocking; the run loop owns the only instance and calls
/// them from a dedicated blocking task.
pub trait Interface: Send {
    /// Initialize the underlying API. Must be called exactly once.
    fn init(&mut self) -> Result<(), HardwareError>;

    /// Boot all modules at the requested depth.
    fn boot(&mut self, mode: BootMode) -> Result<(), HardwareError>;

    fn num_modules(&self) -> u16;

    fn num_channels(&self) -> u16;

    /// Physical slot number for a module index.
    fn slot_number(&self, module: u16) -> Result<u16, HardwareError>;

    fn module_info(&self, module: u16) -> Result<ModuleInfo, HardwareError>;

    // Parameter I/O. Module parameters are 32-bit words, channel parameters
    // are floating point, matching the DSP variable layout.

    fn read_mod_par(&mut self, name: &str, module: u16) -> Result<Word, HardwareError>;

    fn write_mod_par(&mut self, name: &str, value: Word, module: u16)
        -> Result<(), HardwareError>;

    fn read_chan_par(&mut self, name: &str, module: u16, channel: u16)
        -> Result<f64, HardwareError>;

    fn write_chan_par(
        &mut self,
        name: &str,
        value: f64,
        module: u16,
        channel: u16,
    ) -> Result<(), HardwareError>;

    /// Persist the DSP parameter set, optionally to an explicit file.
    fn save_dsp_parameters(&mut self, path: Option<&Path>) -> Result<(), HardwareError>;

    // Setup utilities.

    /// Adjust the DC offsets of one module's channels.
    fn adjust_offsets(&mut self, module: u16) -> Result<(), HardwareError>;

    /// Search for the decay constant of one channel; returns tau in µs.
    fn find_tau(&mut self, module: u16, channel: u16) -> Result<f64, HardwareError>;

    /// Fill the module's trace buffers. Must precede [`Self::read_chan_trace`].
    fn acquire_traces(&mut self, module: u16) -> Result<(), HardwareError>;

    /// Copy the latest trace of one channel into `buf`.
    fn read_chan_trace(
        &mut self,
        buf: &mut [u16],
        module: u16,
        channel: u16,
    ) -> Result<(), HardwareError>;

    /// Number of samples returned by [`Self::read_chan_trace`].
    fn trace_length(&self) -> usize;

    // Run control.

    fn start_list_mode_run(&mut self) -> Result<(), HardwareError>;

    fn start_histogram_run(&mut self) -> Result<(), HardwareError>;

    /// Clear any preset run-length so histogram runs are unbounded.
    fn remove_preset_run_length(&mut self, module: u16) -> Result<(), HardwareError>;

    fn end_run(&mut self) -> Result<(), HardwareError>;

    /// True while the module reports an active run.
    fn check_run_status(&mut self, module: u16) -> Result<bool, HardwareError>;

    // FIFO readout.

    /// Number of words waiting in the module's FIFO.
    fn check_fifo_words(&mut self, module: u16) -> Result<usize, HardwareError>;

    /// Read exactly `buf.len()` words from the module's FIFO.
    fn read_fifo_words(&mut self, buf: &mut [Word], module: u16) -> Result<(), HardwareError>;

    // Statistics.

    /// Refresh the statistics block of a module.
    fn get_statistics(&mut self, module: u16) -> Result<(), HardwareError>;

    /// Input count rate of a channel, from the latest statistics block.
    fn input_count_rate(&self, module: u16, channel: u16) -> f64;

    /// Output count rate of a channel, from the latest statistics block.
    fn output_count_rate(&self, module: u16, channel: u16) -> f64;

    // Histogramming.

    /// Copy the current hardware histogram of one channel into `buf`.
    fn read_histogram(
        &mut self,
        buf: &mut [Word],
        module: u16,
        channel: u16,
    ) -> Result<(), HardwareError>;
}
