//! MCA histogramming mode
//!
//! During an MCA run the controller steps once per second: every channel's
//! hardware-side histogram is read back and the on-disk snapshot is
//! rewritten. No list-mode data flows in this mode.

use crate::common::Word;
use crate::hardware::{HardwareError, Interface};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Bins per channel histogram.
pub const HISTOGRAM_BINS: usize = 16384;

const SNAPSHOT_MAGIC: &[u8; 8] = b"PIXMCA01";

/// MCA errors
#[derive(Error, Debug)]
pub enum McaError {
    #[error("histogram run is no longer active")]
    RunStopped,

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One channel's histogram.
pub struct Histogram {
    pub module: u16,
    pub channel: u16,
    pub bins: Vec<Word>,
}

impl Histogram {
    fn new(module: u16, channel: u16) -> Self {
        Self {
            module,
            channel,
            bins: vec![0; HISTOGRAM_BINS],
        }
    }

    /// Total counts across all bins.
    pub fn counts(&self) -> u64 {
        self.bins.iter().map(|&bin| bin as u64).sum()
    }
}

/// Per-channel histogram accumulator for one MCA run.
pub struct Mca {
    histograms: Vec<Histogram>,
    snapshot_path: PathBuf,
    started: Instant,
}

impl Mca {
    /// Create histograms for every channel and verify the snapshot path is
    /// writable. `basename` becomes `{basename}.dat`.
    pub fn new(pif: &dyn Interface, basename: &str) -> Result<Self, McaError> {
        let mut histograms = Vec::new();
        for module in 0..pif.num_modules() {
            for channel in 0..pif.num_channels() {
                histograms.push(Histogram::new(module, channel));
            }
        }

        let snapshot_path = PathBuf::from(format!("{}.dat", basename));
        // Fail now, not on the first step, if the path cannot be written.
        File::create(&snapshot_path)?;

        Ok(Self {
            histograms,
            snapshot_path,
            started: Instant::now(),
        })
    }

    /// Seconds since the MCA was created.
    pub fn run_time_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn snapshot_path(&self) -> &PathBuf {
        &self.snapshot_path
    }

    pub fn histograms(&self) -> &[Histogram] {
        &self.histograms
    }

    /// Read every channel's hardware histogram and rewrite the snapshot.
    pub fn step(&mut self, pif: &mut dyn Interface) -> Result<(), McaError> {
        if !pif.check_run_status(0)? {
            return Err(McaError::RunStopped);
        }

        for histogram in &mut self.histograms {
            pif.read_histogram(&mut histogram.bins, histogram.module, histogram.channel)?;
        }
        self.flush()?;

        debug!(
            run_time_s = format_args!("{:.1}", self.run_time_secs()),
            "MCA step complete"
        );
        Ok(())
    }

    /// Rewrite the snapshot file: magic, histogram count, then per channel
    /// `module, channel, bin count, bins…`, all little-endian.
    fn flush(&self) -> Result<(), McaError> {
        let file = File::create(&self.snapshot_path)?;
        let mut writer = BufWriter::with_capacity(256 * 1024, file);

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&(self.histograms.len() as u32).to_le_bytes())?;
        for histogram in &self.histograms {
            writer.write_all(&(histogram.module as u32).to_le_bytes())?;
            writer.write_all(&(histogram.channel as u32).to_le_bytes())?;
            writer.write_all(&(histogram.bins.len() as u32).to_le_bytes())?;
            for bin in &histogram.bins {
                writer.write_all(&bin.to_le_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrateConfig;
    use crate::hardware::{BootMode, EmulatedInterface};
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    fn basename() -> String {
        std::env::temp_dir()
            .join(format!(
                "pixie-daq-mca-{}-{}",
                std::process::id(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ))
            .to_string_lossy()
            .into_owned()
    }

    fn booted_emulator() -> EmulatedInterface {
        let config = CrateConfig::default();
        let mut pif = EmulatedInterface::with_seed(&config, 11);
        pif.init().unwrap();
        pif.boot(BootMode::Complete).unwrap();
        pif
    }

    #[test]
    fn new_creates_one_histogram_per_channel() {
        let pif = booted_emulator();
        let mca = Mca::new(&pif, &basename()).unwrap();
        assert_eq!(
            mca.histograms().len(),
            pif.num_modules() as usize * pif.num_channels() as usize
        );
        std::fs::remove_file(mca.snapshot_path()).ok();
    }

    #[test]
    fn step_fails_without_an_active_run() {
        let mut pif = booted_emulator();
        let mut mca = Mca::new(&pif, &basename()).unwrap();
        assert!(matches!(mca.step(&mut pif), Err(McaError::RunStopped)));
        std::fs::remove_file(mca.snapshot_path()).ok();
    }

    #[test]
    fn step_accumulates_counts_and_writes_snapshot() {
        let mut pif = booted_emulator();
        pif.start_histogram_run().unwrap();
        let mut mca = Mca::new(&pif, &basename()).unwrap();

        mca.step(&mut pif).unwrap();
        let first: u64 = mca.histograms().iter().map(|h| h.counts()).sum();
        mca.step(&mut pif).unwrap();
        let second: u64 = mca.histograms().iter().map(|h| h.counts()).sum();
        assert!(first > 0);
        assert!(second > first);

        let snapshot = std::fs::read(mca.snapshot_path()).unwrap();
        assert!(snapshot.starts_with(SNAPSHOT_MAGIC));
        let expected =
            8 + 4 + mca.histograms().len() * (12 + 4 * HISTOGRAM_BINS);
        assert_eq!(snapshot.len(), expected);
        std::fs::remove_file(mca.snapshot_path()).ok();
    }

    #[test]
    fn run_time_is_monotonic() {
        let pif = booted_emulator();
        let mca = Mca::new(&pif, &basename()).unwrap();
        let first = mca.run_time_secs();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(mca.run_time_secs() > first);
        std::fs::remove_file(mca.snapshot_path()).ok();
    }
}
