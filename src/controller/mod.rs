//! Run controller
//!
//! Hosts the two long-lived activities of the process: the command loop,
//! which parses operator input, and the run loop, which owns the hardware
//! interface and drives acquisition. The command loop runs as an async task
//! over stdin; the run loop runs on a blocking task the same way the
//! hardware read loop of a digitizer reader does.

pub mod args;
pub mod commands;
pub mod run_loop;

pub use commands::{CommandExit, CommandLoop};
pub use run_loop::RunLoop;

use crate::broadcast::BroadcastClient;
use crate::common::{ControlFlags, RunRequest, RunState};
use crate::config::CrateConfig;
use crate::hardware::{BootMode, HardwareError, Interface};
use crate::output::OutputFile;
use crate::spill::SpillDrainer;
use crate::stats::StatsHandler;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Depth of the operator request queue.
const REQUEST_QUEUE: usize = 16;

/// Controller errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run loop panicked")]
    RunLoopPanic,
}

/// Output routing and polling settings, adjustable from the command loop.
///
/// Single writer (the command loop); the run loop only reads.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Output directory, always with a trailing separator.
    pub output_dir: String,
    pub file_prefix: String,
    /// Run title; at most 80 characters for the ldf format.
    pub output_title: String,
    pub next_run_number: u32,
    /// FIFO polling threshold in words.
    pub thresh_words: usize,
    /// Seconds between statistics dumps; non-positive disables them.
    pub stats_interval_secs: f64,
}

impl RunSettings {
    pub fn from_config(config: &CrateConfig) -> Self {
        let mut output_dir = config.output.directory.clone();
        if !output_dir.ends_with('/') {
            output_dir.push('/');
        }
        Self {
            output_dir,
            file_prefix: config.output.prefix.clone(),
            output_title: config.output.title.clone(),
            next_run_number: config.output.next_run_number,
            thresh_words: config.fifo.thresh_words(),
            stats_interval_secs: config.stats.dump_interval_secs,
        }
    }
}

/// State shared between the command loop and the run loop.
pub struct Shared {
    pub flags: ControlFlags,
    pub settings: Mutex<RunSettings>,
}

impl Shared {
    pub fn settings(&self) -> std::sync::MutexGuard<'_, RunSettings> {
        self.settings.lock().expect("settings lock poisoned")
    }
}

/// Owns all controller state and spawns the two activities.
pub struct RunController {
    config: CrateConfig,
    pif: Box<dyn Interface>,
    shared: Arc<Shared>,
}

impl RunController {
    /// Construct the controller. Reports the scheduler policy the process
    /// runs under; the policy is never changed.
    pub fn new(config: CrateConfig, pif: Box<dyn Interface>) -> Self {
        report_scheduler_policy();
        let shared = Arc::new(Shared {
            flags: ControlFlags::new(),
            settings: Mutex::new(RunSettings::from_config(&config)),
        });
        Self {
            config,
            pif,
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Initialize the hardware: API init, module banner, boot, module
    /// synchronization. Any failure aborts startup.
    pub fn initialize(&mut self) -> Result<(), ControllerError> {
        self.pif.init()?;

        for module in 0..self.pif.num_modules() {
            match self.pif.module_info(module) {
                Ok(info) => info!(
                    module,
                    serial = info.serial_number,
                    revision = format_args!("{:X}", info.revision),
                    adc = format_args!("{}-bit {} MS/s", info.adc_bits, info.adc_msps),
                    "module found"
                ),
                Err(e) => warn!(module, error = %e, "module info unavailable"),
            }
        }

        let mode = if ControlFlags::get(&self.shared.flags.boot_fast) {
            BootMode::Fast
        } else {
            BootMode::Complete
        };
        self.pif
            .boot(mode)
            .map_err(|e| ControllerError::Init(format!("boot failed: {}", e)))?;

        self.synchronize_modules()
            .map_err(|e| ControllerError::Init(format!("module synchronization failed: {}", e)))?;

        Ok(())
    }

    /// Put every module into a common clock state: `SYNCH_WAIT` on the first
    /// module, `IN_SYNCH` cleared everywhere.
    fn synchronize_modules(&mut self) -> Result<(), HardwareError> {
        self.pif.write_mod_par("SYNCH_WAIT", 1, 0)?;
        for module in 0..self.pif.num_modules() {
            self.pif.write_mod_par("IN_SYNCH", 0, module)?;
        }
        info!("modules synchronized");
        Ok(())
    }

    /// Run both activities to completion. Returns the command loop's exit
    /// disposition so the binary can pick the process exit code.
    pub async fn run(self) -> Result<CommandExit, ControllerError> {
        let (request_tx, request_rx) = mpsc::channel::<RunRequest>(REQUEST_QUEUE);
        let (state_tx, state_rx) = watch::channel(RunState::Idle);

        let client = BroadcastClient::new(&self.config.broadcast.endpoint)?;
        let stats = {
            let mut stats =
                StatsHandler::new(self.config.modules.count, self.config.modules.channels);
            stats.set_dump_interval(self.shared.settings().stats_interval_secs);
            stats
        };
        let drainer = SpillDrainer::new(
            self.config.modules.slot_map.clone(),
            self.config.fifo.capacity_words,
            self.config.fifo.min_read_words,
            self.config.fifo.poll_tries,
        );
        let mut output = OutputFile::new();
        output.set_debug_mode(ControlFlags::get(&self.shared.flags.debug));

        let run_loop = RunLoop::new(
            self.pif,
            Arc::clone(&self.shared),
            request_rx,
            state_tx,
            drainer,
            stats,
            output,
            client,
            self.config.modules.channels,
        );
        let run_handle = tokio::task::spawn_blocking(move || run_loop.run());

        let command_loop = CommandLoop::new(
            Arc::clone(&self.shared),
            request_tx,
            state_rx,
            self.config.clone(),
        );
        let exit = command_loop.run().await;

        // The command loop only returns after requesting the kill; make sure
        // the flag is set even on unexpected exits, then join the run loop.
        self.shared.flags.kill_all.store(true, Ordering::Relaxed);
        run_handle
            .await
            .map_err(|_| ControllerError::RunLoopPanic)?;

        Ok(exit)
    }
}

/// Report whether the process runs under a batch, standard, or unexpected
/// scheduler policy.
fn report_scheduler_policy() {
    let policy = unsafe { libc::sched_getscheduler(0) };
    if policy == libc::SCHED_BATCH {
        info!("scheduler policy: SCHED_BATCH");
    } else if policy == libc::SCHED_OTHER {
        info!("scheduler policy: standard (SCHED_OTHER)");
    } else {
        warn!(policy, "scheduler policy: unexpected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_force_trailing_separator() {
        let mut config = CrateConfig::default();
        config.output.directory = "/tmp/data".to_string();
        let settings = RunSettings::from_config(&config);
        assert_eq!(settings.output_dir, "/tmp/data/");

        config.output.directory = "/tmp/data/".to_string();
        let settings = RunSettings::from_config(&config);
        assert_eq!(settings.output_dir, "/tmp/data/");
    }

    #[test]
    fn settings_derive_threshold_from_config() {
        let config = CrateConfig::default();
        let settings = RunSettings::from_config(&config);
        assert_eq!(settings.thresh_words, 65_536);
        assert_eq!(settings.next_run_number, 1);
    }
}
