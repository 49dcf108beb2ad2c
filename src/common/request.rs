//! Operator requests dispatched from the command loop to the run loop
//!
//! Every one-shot action the operator can trigger is a message on a bounded
//! channel. The run loop drains the queue once per iteration, so a request is
//! picked up within one polling pass. Hardware parameter work rides along as
//! [`HardwareOp`] because the run loop is the only owner of the interface.

use std::path::PathBuf;

/// Inclusive module or channel range, parsed from `start[:stop]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRange {
    pub start: u16,
    pub stop: u16,
}

impl ParamRange {
    pub fn single(index: u16) -> Self {
        Self {
            start: index,
            stop: index,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.stop
    }
}

impl std::fmt::Display for ParamRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.stop {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.stop)
        }
    }
}

/// Parameter and utility work executed by the run loop while idle.
#[derive(Debug, Clone)]
pub enum HardwareOp {
    /// `pread`: print a channel parameter over module/channel ranges.
    ReadChanPar {
        modules: ParamRange,
        channels: ParamRange,
        name: String,
    },
    /// `pwrite`: write a channel parameter, then save DSP state.
    WriteChanPar {
        modules: ParamRange,
        channels: ParamRange,
        name: String,
        value: f64,
    },
    /// `pmread`: print a module parameter over a module range.
    ReadModPar { modules: ParamRange, name: String },
    /// `pmwrite`: write a module parameter, then save DSP state.
    WriteModPar {
        modules: ParamRange,
        name: String,
        value: u32,
    },
    /// `save`: persist DSP parameters, optionally to a given file.
    SaveDsp { path: Option<PathBuf> },
    /// `dump`: write every channel and module parameter to a set file.
    DumpParams { path: PathBuf },
    /// `adjust_offsets`: baseline adjustment per module, then save.
    AdjustOffsets { modules: ParamRange },
    /// `find_tau`: decay-constant search on one channel.
    FindTau { module: u16, channel: u16 },
    /// `toggle`: flip a CHANNEL_CSRA bit over ranges, then save.
    ToggleCsraBit {
        modules: ParamRange,
        channels: ParamRange,
        bit: u8,
    },
    /// `toggle_bit`: flip an arbitrary bit of a channel parameter.
    ToggleBit {
        module: u16,
        channel: u16,
        name: String,
        bit: u8,
    },
    /// `get_traces`: capture traces for a module and write them to disk.
    GetTraces {
        module: u16,
        channel: u16,
        threshold: u32,
    },
}

/// One-shot requests consumed by the run loop.
#[derive(Debug, Clone)]
pub enum RunRequest {
    /// Start list-mode acquisition. `duration` bounds the run in seconds.
    StartAcq { record: bool, duration: Option<f64> },
    /// Stop acquisition or an MCA run.
    StopAcq,
    /// Flush the current spill regardless of the FIFO threshold.
    ForceSpill,
    /// Reboot the crate modules.
    Reboot,
    /// Operator keypress acknowledging a finished reboot.
    Acknowledge,
    /// Start an MCA histogram run. `seconds == 0` means unbounded.
    StartMca { seconds: f64, basename: String },
    /// Supersedes everything; stop any run and exit the run loop.
    KillAll,
    /// Parameter or utility work against the hardware interface.
    Hardware(HardwareOp),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_iterates_inclusively() {
        let range = ParamRange { start: 2, stop: 5 };
        let values: Vec<u16> = range.iter().collect();
        assert_eq!(values, vec![2, 3, 4, 5]);
    }

    #[test]
    fn single_range_displays_one_number() {
        assert_eq!(ParamRange::single(7).to_string(), "7");
        assert_eq!(ParamRange { start: 0, stop: 3 }.to_string(), "0:3");
    }
}
