//! Run loop: owns the hardware and drives acquisition
//!
//! Cooperative polling loop on a blocking task. Each pass consumes queued
//! operator requests, then evaluates in priority order: kill, reboot, MCA,
//! acquisition start, and while running the stop request, the timed-run
//! deadline and one FIFO drain. A pass ends with a status-line update; when
//! nothing is active the loop sleeps one second.

use super::Shared;
use crate::broadcast::{BroadcastClient, CLOSE_FILE_MSG, KILL_SOCKET_MSG, OPEN_FILE_MSG};
use crate::common::{ControlFlags, HardwareOp, RunRequest, RunState, Word};
use crate::hardware::{params, BootMode, Interface};
use crate::mca::Mca;
use crate::output::{next_run_file, OutputFile};
use crate::spill::{DrainError, SpillDrainer};
use crate::stats::{format_size, StatsHandler};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Output file plus broadcast socket: everything a spill is emitted to.
///
/// Kept separate from the rest of the run loop so emission can work on a
/// spill slice that still borrows the drainer.
struct Emitter {
    output: OutputFile,
    client: BroadcastClient,
}

impl Emitter {
    /// Open the next run file, announce it, and reset statistics.
    fn open_file(&mut self, shared: &Shared, stats: &mut StatsHandler, continue_run: bool) -> bool {
        if self.output.is_open() {
            warn!("unexpected output file open, closing it");
            self.close_file(shared, false);
            return false;
        }

        self.output
            .set_debug_mode(ControlFlags::get(&shared.flags.debug));
        let (title, run_number, prefix, directory) = {
            let settings = shared.settings();
            (
                settings.output_title.clone(),
                settings.next_run_number,
                settings.file_prefix.clone(),
                settings.output_dir.clone(),
            )
        };

        match self
            .output
            .open_new_file(&title, run_number, &prefix, &directory, continue_run)
        {
            Ok(()) => {
                if !continue_run {
                    stats.clear();
                }
                if let Err(e) = self.client.send_message(OPEN_FILE_MSG) {
                    warn!(error = %e, "open-file notification failed");
                }
                ControlFlags::set(&shared.flags.file_open, true);
                println!("|- Opened output file '{}'.", self.output.current_path().display());
                true
            }
            Err(e) => {
                error!(error = %e, "failed to open output file, check that the path is correct");
                false
            }
        }
    }

    /// Close the current file, announce it, and on a real run end advance
    /// the run number past anything already on disk.
    fn close_file(&mut self, shared: &Shared, continue_run: bool) -> bool {
        if !self.output.is_open() {
            warn!("no output file is open");
            ControlFlags::set(&shared.flags.file_open, false);
            return false;
        }

        if let Err(e) = self.output.close() {
            error!(error = %e, "error while closing output file");
        }
        if let Err(e) = self.client.send_message(CLOSE_FILE_MSG) {
            warn!(error = %e, "close-file notification failed");
        }
        ControlFlags::set(&shared.flags.file_open, false);
        println!("|- Closed output file '{}'.", self.output.current_path().display());

        if !continue_run {
            let mut settings = shared.settings();
            let prefix = settings.file_prefix.clone();
            let directory = settings.output_dir.clone();
            let mut next = settings.next_run_number;
            next_run_file(&mut next, &prefix, &directory);
            settings.next_run_number = next;
        }
        true
    }

    /// Write a spill, rolling to the next sub-file when the size cap would
    /// be crossed. Returns false on a run-scope fatal.
    fn write_spill(&mut self, spill: &[Word], shared: &Shared, stats: &mut StatsHandler) -> bool {
        if !self.output.is_open() {
            error!("recording data, but no file is open");
            return false;
        }

        if self.output.would_exceed(spill.len()) {
            info!(
                size = self.output.size(),
                "maximum file size reached, rolling to a new output file"
            );
            self.close_file(shared, true);
            if !self.open_file(shared, stats, true) {
                return false;
            }
        }

        match self.output.write(spill) {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "spill write failed");
                false
            }
        }
    }

    /// Announce a spill: chunked payload in shm mode, a notification
    /// packet otherwise. Broadcast failures are not fatal.
    fn broadcast(&self, spill: &[Word], shm_mode: bool) {
        let result = if shm_mode {
            self.client.send_spill(spill)
        } else {
            self.output.send_packet(&self.client)
        };
        if let Err(e) = result {
            warn!(error = %e, "spill broadcast failed");
        }
    }
}

/// The acquisition side of the controller.
pub struct RunLoop {
    pif: Box<dyn Interface>,
    shared: Arc<Shared>,
    requests: mpsc::Receiver<RunRequest>,
    state_tx: watch::Sender<RunState>,
    drainer: SpillDrainer,
    stats: StatsHandler,
    emitter: Emitter,
    num_channels: u16,

    // Request latches, consumed by the loop body.
    do_start_acq: bool,
    pending_record: bool,
    pending_duration: Option<f64>,
    do_stop_acq: bool,
    do_reboot: bool,
    force_spill: bool,
    start_mca: bool,
    mca_seconds: f64,
    mca_basename: String,
    kill: bool,

    mca: Option<Mca>,
    acq_running: bool,
    record_data: bool,
    /// Wall-clock run deadline in seconds; non-positive means unbounded.
    run_time: f64,
    acq_start: Instant,
    /// Origin for microsecond spill timing.
    start_time: Instant,
    last_spill_us: f64,
    last_status: String,
}

impl RunLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pif: Box<dyn Interface>,
        shared: Arc<Shared>,
        requests: mpsc::Receiver<RunRequest>,
        state_tx: watch::Sender<RunState>,
        drainer: SpillDrainer,
        stats: StatsHandler,
        output: OutputFile,
        client: BroadcastClient,
        num_channels: u16,
    ) -> Self {
        Self {
            pif,
            shared,
            requests,
            state_tx,
            drainer,
            stats,
            emitter: Emitter { output, client },
            num_channels,
            do_start_acq: false,
            pending_record: false,
            pending_duration: None,
            do_stop_acq: false,
            do_reboot: false,
            force_spill: false,
            start_mca: false,
            mca_seconds: 0.0,
            mca_basename: "mca".to_string(),
            kill: false,
            mca: None,
            acq_running: false,
            record_data: false,
            run_time: -1.0,
            acq_start: Instant::now(),
            start_time: Instant::now(),
            last_spill_us: 0.0,
            last_status: String::new(),
        }
    }

    pub fn run(mut self) {
        loop {
            self.poll_requests();

            if self.kill || ControlFlags::get(&self.shared.flags.kill_all) {
                // Kill supersedes everything, but a running acquisition is
                // stopped cleanly first.
                if self.acq_running || self.mca.is_some() {
                    self.do_stop_acq = true;
                } else {
                    break;
                }
            }

            if self.do_reboot {
                self.handle_reboot();
            }

            if self.start_mca || self.mca.is_some() {
                self.mca_tick();
            }

            if self.do_start_acq {
                self.start_acquisition();
            }

            if self.acq_running {
                self.check_deadline();
                if self.do_stop_acq {
                    self.finish_run();
                } else {
                    self.read_fifo();
                }
            }

            self.update_status();

            if !self.acq_running && self.mca.is_none() && !self.kill {
                std::thread::sleep(Duration::from_secs(1));
            }
        }

        self.teardown();
        let _ = self.state_tx.send(RunState::Terminated);
        info!("run control exited");
    }

    fn set_state(&self, state: RunState) {
        let _ = self.state_tx.send(state);
    }

    fn poll_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                RunRequest::StartAcq { record, duration } => {
                    self.pending_record = record;
                    self.pending_duration = duration;
                    self.do_start_acq = true;
                }
                RunRequest::StopAcq => self.do_stop_acq = true,
                RunRequest::ForceSpill => self.force_spill = true,
                RunRequest::Reboot => self.do_reboot = true,
                RunRequest::Acknowledge => {}
                RunRequest::StartMca { seconds, basename } => {
                    self.mca_seconds = seconds;
                    self.mca_basename = basename;
                    self.start_mca = true;
                }
                RunRequest::KillAll => self.kill = true,
                RunRequest::Hardware(op) => self.handle_hardware_op(op),
            }
        }
    }

    fn handle_reboot(&mut self) {
        if self.acq_running || self.mca.is_some() {
            // Safety catch; the reboot proceeds once the run has stopped.
            self.do_stop_acq = true;
            return;
        }

        self.set_state(RunState::Rebooting);
        info!("attempting crate reboot");
        match self.pif.boot(BootMode::Complete) {
            Ok(()) => info!("reboot complete"),
            Err(e) => {
                error!(error = %e, "reboot failed");
                ControlFlags::set(&self.shared.flags.had_error, true);
            }
        }
        println!("Press Enter to continue...");

        // Block until the operator acknowledges; anything else typed during
        // the pause is discarded.
        loop {
            match self.requests.blocking_recv() {
                Some(RunRequest::Acknowledge) | None => break,
                Some(RunRequest::KillAll) => {
                    self.kill = true;
                    break;
                }
                Some(request) => debug!(?request, "request discarded during reboot"),
            }
        }

        self.do_reboot = false;
        self.set_state(RunState::Idle);
    }

    fn mca_tick(&mut self) {
        if self.acq_running {
            self.do_stop_acq = true;
            return;
        }

        if self.mca.is_none() {
            self.set_state(RunState::McaStarting);
            if self.mca_seconds > 0.0 {
                info!(seconds = self.mca_seconds, basename = %self.mca_basename, "performing MCA data run");
            } else {
                info!(basename = %self.mca_basename, "performing unbounded MCA data run, 'stop' ends it");
            }

            match self.start_mca_run() {
                Ok(mca) => {
                    self.mca = Some(mca);
                    self.start_mca = false;
                    self.set_state(RunState::McaRunning);
                }
                Err(e) => {
                    error!(error = %e, "failed to start MCA run");
                    ControlFlags::set(&self.shared.flags.had_error, true);
                    self.start_mca = false;
                    self.set_state(RunState::Idle);
                    return;
                }
            }
        }

        let elapsed = self.mca.as_ref().map(|mca| mca.run_time_secs()).unwrap_or(0.0);
        let deadline = self.mca_seconds > 0.0 && elapsed >= self.mca_seconds;
        if deadline || self.do_stop_acq {
            if let Err(e) = self.pif.end_run() {
                warn!(error = %e, "ending MCA run reported an error");
            }
            info!(
                ran_s = format_args!("{:.1}", elapsed),
                "ending MCA run"
            );
            self.mca = None;
            self.do_stop_acq = false;
            self.set_state(RunState::Idle);
        } else {
            std::thread::sleep(Duration::from_secs(1));
            let step = match self.mca.as_mut() {
                Some(mca) => mca.step(self.pif.as_mut()),
                None => return,
            };
            if let Err(e) = step {
                error!(error = %e, "MCA run TERMINATED");
                let _ = self.pif.end_run();
                self.mca = None;
                ControlFlags::set(&self.shared.flags.had_error, true);
                self.set_state(RunState::Idle);
            }
        }
    }

    fn start_mca_run(&mut self) -> Result<Mca, crate::mca::McaError> {
        let mca = Mca::new(self.pif.as_ref(), &self.mca_basename)?;
        for module in 0..self.pif.num_modules() {
            self.pif.remove_preset_run_length(module)?;
        }
        self.pif.start_histogram_run()?;
        Ok(mca)
    }

    fn start_acquisition(&mut self) {
        self.do_start_acq = false;
        if self.acq_running {
            info!("acquisition already running");
            return;
        }

        self.set_state(RunState::AcqStarting);
        self.record_data = self.pending_record;
        ControlFlags::set(&self.shared.flags.record_data, self.record_data);
        self.run_time = self.pending_duration.unwrap_or(-1.0);
        if self.run_time > 0.0 {
            info!(seconds = self.run_time, "running for a bounded time");
        }

        if self.record_data && !self.emitter.open_file(&self.shared, &mut self.stats, false) {
            ControlFlags::set(&self.shared.flags.had_error, true);
            self.record_data = false;
            ControlFlags::set(&self.shared.flags.record_data, false);
            self.set_state(RunState::Idle);
            return;
        }

        match self.pif.start_list_mode_run() {
            Ok(()) => {
                if self.record_data {
                    info!(run = self.emitter.output.run_number(), "run started");
                } else {
                    info!("acquisition started (not recording)");
                }
                self.acq_running = true;
                self.acq_start = Instant::now();
                self.start_time = Instant::now();
                self.last_spill_us = 0.0;
                self.set_state(RunState::AcqRunning);
            }
            Err(e) => {
                error!(error = %e, "failed to start list mode run, try rebooting the crate");
                ControlFlags::set(&self.shared.flags.had_error, true);
                if self.emitter.output.is_open() {
                    self.emitter.close_file(&self.shared, false);
                }
                self.record_data = false;
                ControlFlags::set(&self.shared.flags.record_data, false);
                self.set_state(RunState::Idle);
            }
        }
    }

    fn check_deadline(&mut self) {
        if self.run_time > 0.0
            && !self.do_stop_acq
            && self.acq_start.elapsed().as_secs_f64() >= self.run_time
        {
            info!(seconds = self.run_time, "timed run complete");
            if self.record_data {
                info!(
                    run = self.emitter.output.run_number(),
                    time_s = format_args!("{:.2}", self.stats.total_time()),
                    "run time"
                );
            }
            self.do_stop_acq = true;
        }
    }

    /// Stop sequence: final drain, end the hardware run, rescue what each
    /// module still holds, report partial events, dump statistics and close
    /// the file.
    fn finish_run(&mut self) {
        self.set_state(RunState::AcqStopping);

        if !ControlFlags::get(&self.shared.flags.had_error) {
            self.read_fifo();
        }

        if let Err(e) = self.pif.end_run() {
            warn!(error = %e, "end run reported an error");
        }

        let quiet = ControlFlags::get(&self.shared.flags.quiet);
        for module in 0..self.drainer.num_modules() {
            if self.pif.check_run_status(module).unwrap_or(false) {
                let words = self.pif.check_fifo_words(module).unwrap_or(0);
                if !quiet {
                    println!("Module {} still has {} words in the FIFO.", module, words);
                }
                // The remainder may be below threshold; force it out.
                self.force_spill = true;
                std::thread::sleep(Duration::from_secs(1));
                if !ControlFlags::get(&self.shared.flags.had_error) {
                    self.read_fifo();
                }
            }

            let partial = self.drainer.clear_partial(module);
            if partial > 0 {
                warn!(module, words = partial, "run end status: (partial evt)");
            }
            if self.pif.check_run_status(module).unwrap_or(false) {
                error!(module, "run did not end cleanly");
                ControlFlags::set(&self.shared.flags.had_error, true);
            } else {
                info!(module, "run end status ok");
            }
        }

        if self.record_data {
            info!(
                run = self.emitter.output.run_number(),
                time_s = format_args!("{:.2}", self.stats.total_time()),
                "run stopped"
            );
        } else {
            info!("acquisition stopped");
        }

        self.stats.clear_rates();
        self.stats.dump();
        self.stats.clear_totals();

        if self.emitter.output.is_open() {
            self.emitter.close_file(&self.shared, false);
        }

        self.do_stop_acq = false;
        self.acq_running = false;
        self.record_data = false;
        ControlFlags::set(&self.shared.flags.record_data, false);
        self.set_state(RunState::Idle);
    }

    /// One drain cycle: poll, drain, account, emit.
    fn read_fifo(&mut self) {
        if !self.acq_running {
            return;
        }

        let force = std::mem::take(&mut self.force_spill);
        let (thresh_words, stats_interval) = {
            let settings = self.shared.settings();
            (settings.thresh_words, settings.stats_interval_secs)
        };
        self.stats.set_dump_interval(stats_interval);
        let quiet = ControlFlags::get(&self.shared.flags.quiet);
        let debug_mode = ControlFlags::get(&self.shared.flags.debug);

        match self
            .drainer
            .drain(self.pif.as_mut(), thresh_words, force, &mut self.stats)
        {
            Ok(None) => {}
            Ok(Some(spill)) => {
                let total_words = spill.len();

                let spill_us = self.start_time.elapsed().as_micros() as f64;
                let duration_us = spill_us - self.last_spill_us;
                self.last_spill_us = spill_us;

                if self.stats.add_time(duration_us * 1e-6) {
                    read_scalers(self.pif.as_mut(), &mut self.stats, self.num_channels);
                    self.stats.dump();
                    self.stats.clear_rates();
                }

                if !quiet || debug_mode {
                    println!("Writing/Broadcasting {} words.", total_words);
                }

                if self.record_data
                    && !self.emitter.write_spill(spill, &self.shared, &mut self.stats)
                {
                    ControlFlags::set(&self.shared.flags.had_error, true);
                    self.do_stop_acq = true;
                }

                self.emitter
                    .broadcast(spill, ControlFlags::get(&self.shared.flags.shm_mode));
            }
            Err(e) => {
                if let DrainError::Corrupt { module, report } = &e {
                    error!(module = *module, "parsing indicated corrupted data");
                    println!("{}", report);
                } else {
                    error!(error = %e, "drain cycle aborted");
                }
                ControlFlags::set(&self.shared.flags.had_error, true);
                self.do_stop_acq = true;
            }
        }
    }

    fn update_status(&mut self) {
        let flags = &self.shared.flags;
        let mut status = String::new();

        if ControlFlags::get(&flags.had_error) {
            status.push_str("[ERROR]");
        } else if self.acq_running {
            status.push_str("[ACQ]");
        } else if self.mca.is_some() {
            status.push_str("[MCA]");
        } else {
            status.push_str("[IDLE]");
        }

        if self.emitter.output.is_open() {
            status.push_str(&format!(" Run {}", self.emitter.output.run_number()));
        }

        if let Some(mca) = &self.mca {
            if self.mca_seconds > 0.0 {
                status.push_str(&format!(
                    " {:.0}s of {:.0}s",
                    mca.run_time_secs(),
                    self.mca_seconds
                ));
            } else {
                status.push_str(&format!(" {:.0}s", mca.run_time_secs()));
            }
        } else {
            status.push_str(&format!(
                " {}s {}/s",
                self.stats.total_time() as i64,
                format_size(self.stats.total_data_rate())
            ));
        }

        if self.emitter.output.is_open() {
            status.push_str(&format!(
                " {} {}",
                format_size(self.emitter.output.size() as f64),
                self.emitter.output.current_path().display()
            ));
        }

        if status != self.last_status {
            if !ControlFlags::get(&flags.quiet) {
                println!("{}", status);
            }
            self.last_status = status;
        }
    }

    /// Teardown in order: output file, broadcast socket, statistics,
    /// hardware interface.
    fn teardown(&mut self) {
        if self.emitter.output.is_open() {
            self.emitter.close_file(&self.shared, false);
        }
        if let Err(e) = self.emitter.client.send_message(KILL_SOCKET_MSG) {
            warn!(error = %e, "kill-socket notification failed");
        }
        self.stats.dump();
        if self.acq_running || self.mca.is_some() {
            let _ = self.pif.end_run();
        }
    }

    // ---- parameter and utility operations -------------------------------

    /// Execute a hardware op. Only legal while nothing is running; the
    /// command loop guards this, but re-check in case of a race.
    fn handle_hardware_op(&mut self, op: HardwareOp) {
        if self.acq_running || self.mca.is_some() {
            println!("Cannot touch hardware parameters while a run is active.");
            return;
        }

        match op {
            HardwareOp::ReadChanPar {
                modules,
                channels,
                name,
            } => {
                for module in modules.iter() {
                    for channel in channels.iter() {
                        match self.pif.read_chan_par(&name, module, channel) {
                            Ok(value) => {
                                println!("{}[{}][{}] = {}", name, module, channel, value)
                            }
                            Err(e) => println!("ERROR: {}", e),
                        }
                    }
                }
            }
            HardwareOp::WriteChanPar {
                modules,
                channels,
                name,
                value,
            } => {
                let mut failed = false;
                for module in modules.iter() {
                    for channel in channels.iter() {
                        if let Err(e) = self.pif.write_chan_par(&name, value, module, channel) {
                            println!("ERROR: {}", e);
                            failed = true;
                        }
                    }
                }
                if !failed {
                    self.save_dsp(None);
                }
            }
            HardwareOp::ReadModPar { modules, name } => {
                for module in modules.iter() {
                    match self.pif.read_mod_par(&name, module) {
                        Ok(value) => {
                            println!("{}[{}] = 0x{:08x} ({})", name, module, value, value)
                        }
                        Err(e) => println!("ERROR: {}", e),
                    }
                }
            }
            HardwareOp::WriteModPar {
                modules,
                name,
                value,
            } => {
                let mut failed = false;
                for module in modules.iter() {
                    if let Err(e) = self.pif.write_mod_par(&name, value, module) {
                        println!("ERROR: {}", e);
                        failed = true;
                    }
                }
                if !failed {
                    self.save_dsp(None);
                }
            }
            HardwareOp::SaveDsp { path } => self.save_dsp(path.as_deref()),
            HardwareOp::DumpParams { path } => self.op_dump_params(&path),
            HardwareOp::AdjustOffsets { modules } => {
                let mut failed = false;
                for module in modules.iter() {
                    if let Err(e) = self.pif.adjust_offsets(module) {
                        println!("ERROR: {}", e);
                        failed = true;
                    }
                }
                if !failed {
                    self.save_dsp(None);
                }
            }
            HardwareOp::FindTau { module, channel } => {
                match self.pif.find_tau(module, channel) {
                    Ok(tau) => println!("Tau for M{}C{}: {:.3} us", module, channel, tau),
                    Err(e) => println!("ERROR: {}", e),
                }
            }
            HardwareOp::ToggleCsraBit {
                modules,
                channels,
                bit,
            } => {
                let mut failed = false;
                for module in modules.iter() {
                    for channel in channels.iter() {
                        if let Err(e) = self.toggle_param_bit("CHANNEL_CSRA", module, channel, bit)
                        {
                            println!("ERROR: {}", e);
                            failed = true;
                        }
                    }
                }
                if !failed {
                    self.save_dsp(None);
                }
            }
            HardwareOp::ToggleBit {
                module,
                channel,
                name,
                bit,
            } => match self.toggle_param_bit(&name, module, channel, bit) {
                Ok(()) => self.save_dsp(None),
                Err(e) => println!("ERROR: {}", e),
            },
            HardwareOp::GetTraces {
                module,
                channel,
                threshold,
            } => self.op_get_traces(module, channel, threshold),
        }
    }

    fn save_dsp(&mut self, path: Option<&std::path::Path>) {
        match self.pif.save_dsp_parameters(path) {
            Ok(()) => debug!("DSP parameters saved"),
            Err(e) => println!("ERROR: failed to save DSP parameters: {}", e),
        }
    }

    fn toggle_param_bit(
        &mut self,
        name: &str,
        module: u16,
        channel: u16,
        bit: u8,
    ) -> Result<(), crate::hardware::HardwareError> {
        let current = self.pif.read_chan_par(name, module, channel)? as u32;
        let flipped = current ^ (1u32 << bit);
        self.pif
            .write_chan_par(name, flipped as f64, module, channel)?;
        println!(
            "{}[{}][{}]: 0x{:08x} -> 0x{:08x}",
            name, module, channel, current, flipped
        );
        Ok(())
    }

    /// Dump every channel and module parameter to a flat set file.
    fn op_dump_params(&mut self, path: &std::path::Path) {
        let file = match std::fs::File::create(path) {
            Ok(file) => file,
            Err(e) => {
                println!(
                    "Failed to open output file '{}': {}. Check that the path is correct.",
                    path.display(),
                    e
                );
                return;
            }
        };
        let mut writer = std::io::BufWriter::new(file);

        let num_modules = self.pif.num_modules();
        for &name in params::CHANNEL_PARAMS {
            for module in 0..num_modules {
                for channel in 0..self.num_channels {
                    if let Ok(value) = self.pif.read_chan_par(name, module, channel) {
                        let _ = writeln!(writer, "{} {} {} {}", name, module, channel, value);
                    }
                }
            }
        }
        for &name in params::MODULE_PARAMS {
            for module in 0..num_modules {
                if let Ok(value) = self.pif.read_mod_par(name, module) {
                    let _ = writeln!(writer, "{} {} {}", name, module, value);
                }
            }
        }

        match writer.flush() {
            Ok(()) => println!("Wrote parameter dump to '{}'.", path.display()),
            Err(e) => println!("ERROR: writing '{}' failed: {}", path.display(), e),
        }
    }

    /// Capture traces for every channel of a module, looking for a pulse on
    /// the requested channel, and write them to /tmp/traces.dat.
    fn op_get_traces(&mut self, module: u16, channel: u16, threshold: u32) {
        let trace_len = self.pif.trace_length();
        let num_channels = self.num_channels as usize;
        println!(
            "Searching for traces from mod = {}, chan = {} above threshold = {}.",
            module, channel, threshold
        );

        let mut module_data = vec![0u16; trace_len * num_channels];
        let mut found = false;
        let mut attempts = 0;
        let max_attempts = if threshold == 0 { 1 } else { 100 };

        while attempts < max_attempts {
            attempts += 1;
            if let Err(e) = self.pif.acquire_traces(module) {
                println!("ERROR: {}", e);
                return;
            }
            for ch in 0..num_channels {
                let slice = &mut module_data[ch * trace_len..(ch + 1) * trace_len];
                if let Err(e) = self.pif.read_chan_trace(slice, module, ch as u16) {
                    println!("ERROR: {}", e);
                    return;
                }
            }

            let target = &module_data[channel as usize * trace_len..][..trace_len];
            let (baseline, maximum) = baseline_and_max(target);
            if threshold == 0 || maximum.saturating_sub(baseline as u16) as u32 >= threshold {
                found = true;
                break;
            }
        }

        if found {
            println!("Found trace above threshold in {} attempts.", attempts);
        } else {
            println!(
                "Failed to find trace above threshold in {} attempts!",
                attempts
            );
        }

        println!("  Baselines:");
        for ch in 0..num_channels {
            let trace = &module_data[ch * trace_len..][..trace_len];
            let (baseline, maximum) = baseline_and_max(trace);
            println!("   {:02}: \t{:.1}\t{}", ch, baseline, maximum);
        }

        match write_trace_file(&module_data, trace_len, num_channels) {
            Ok(path) => println!("Traces written to '{}'.", path),
            Err(e) => println!("Could not write /tmp/traces.dat: {}", e),
        }
    }
}

/// Mean of the leading samples and overall maximum of one trace.
fn baseline_and_max(trace: &[u16]) -> (f64, u16) {
    if trace.is_empty() {
        return (0.0, 0);
    }
    let lead = trace.len().min(16);
    let baseline = trace[..lead].iter().map(|&s| s as f64).sum::<f64>() / lead as f64;
    let maximum = trace.iter().copied().max().unwrap_or(0);
    (baseline, maximum)
}

fn write_trace_file(
    module_data: &[u16],
    trace_len: usize,
    num_channels: usize,
) -> std::io::Result<String> {
    let path = "/tmp/traces.dat";
    let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);

    write!(writer, "time")?;
    for ch in 0..num_channels {
        write!(writer, "\tC{:02}", ch)?;
    }
    writeln!(writer)?;

    for sample in 0..trace_len {
        write!(writer, "{}", sample)?;
        for ch in 0..num_channels {
            write!(writer, "\t{}", module_data[ch * trace_len + sample])?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(path.to_string())
}

/// Pull per-channel ICR/OCR from every module into the stats handler.
fn read_scalers(pif: &mut dyn Interface, stats: &mut StatsHandler, num_channels: u16) {
    let mut rates = vec![(0.0, 0.0); num_channels as usize];
    for module in 0..pif.num_modules() {
        if let Err(e) = pif.get_statistics(module) {
            warn!(module, error = %e, "statistics read failed");
            continue;
        }
        for (channel, rate) in rates.iter_mut().enumerate() {
            *rate = (
                pif.input_count_rate(module, channel as u16),
                pif.output_count_rate(module, channel as u16),
            );
        }
        stats.set_xia_rates(module, &rates);
    }
}
