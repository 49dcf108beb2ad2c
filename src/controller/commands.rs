//! Command loop: operator input parsing and dispatch
//!
//! Line-oriented commands on stdin. Each command is looked up in a dispatch
//! table carrying its aliases, usage and summary; handlers validate
//! arguments, check preconditions against the run-state watch channel, and
//! either mutate shared settings directly or enqueue a [`RunRequest`] for
//! the run loop.

use super::args::{is_numeric, parse_f64, parse_range, parse_u32, strip_quotes};
use super::Shared;
use crate::common::{ControlFlags, HardwareOp, RunRequest, RunState};
use crate::config::CrateConfig;
use crate::hardware::params;
use crate::output::next_run_file;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// How the command loop ended; selects the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExit {
    /// Clean shutdown through `quit`/`kill`.
    Clean,
    /// Segmentation-fault pseudo-command; exit with failure.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Run,
    StartAcq,
    TimedRun,
    Stop,
    Spill,
    Shm,
    Mca,
    Reboot,
    Fdir,
    Prefix,
    Title,
    RunNum,
    Stats,
    Thresh,
    Debug,
    Quiet,
    Status,
    Dump,
    PRead,
    PWrite,
    PmRead,
    PmWrite,
    AdjustOffsets,
    FindTau,
    Toggle,
    ToggleBit,
    CsrTest,
    BitTest,
    GetTraces,
    Save,
    Help,
    Quit,
    Kill,
}

struct CommandSpec {
    name: &'static str,
    aliases: &'static [&'static str],
    usage: &'static str,
    summary: &'static str,
    kind: CommandKind,
}

#[rustfmt::skip]
const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "run", aliases: &[], usage: "run", summary: "Start data acquisition and record data to disk", kind: CommandKind::Run },
    CommandSpec { name: "startacq", aliases: &["startvme"], usage: "startacq", summary: "Start data acquisition without recording", kind: CommandKind::StartAcq },
    CommandSpec { name: "timedrun", aliases: &[], usage: "timedrun <seconds>", summary: "Run and record for a fixed number of seconds", kind: CommandKind::TimedRun },
    CommandSpec { name: "stop", aliases: &["stopacq", "stopvme"], usage: "stop", summary: "Stop data acquisition", kind: CommandKind::Stop },
    CommandSpec { name: "spill", aliases: &["hup"], usage: "spill", summary: "Force a dump of the current spill", kind: CommandKind::Spill },
    CommandSpec { name: "shm", aliases: &[], usage: "shm", summary: "Toggle chunked broadcast (shared-memory) mode", kind: CommandKind::Shm },
    CommandSpec { name: "mca", aliases: &["MCA"], usage: "mca [seconds] [basename]", summary: "Record an MCA histogram run (0 s = unbounded)", kind: CommandKind::Mca },
    CommandSpec { name: "reboot", aliases: &[], usage: "reboot", summary: "Reboot the crate modules", kind: CommandKind::Reboot },
    CommandSpec { name: "fdir", aliases: &[], usage: "fdir [path]", summary: "Set the output file directory", kind: CommandKind::Fdir },
    CommandSpec { name: "prefix", aliases: &[], usage: "prefix [name]", summary: "Set the output filename prefix", kind: CommandKind::Prefix },
    CommandSpec { name: "title", aliases: &[], usage: "title [runTitle]", summary: "Set the title of the current run", kind: CommandKind::Title },
    CommandSpec { name: "runnum", aliases: &[], usage: "runnum [number]", summary: "Set the next run number", kind: CommandKind::RunNum },
    CommandSpec { name: "stats", aliases: &[], usage: "stats <seconds>", summary: "Set the delay between statistics dumps", kind: CommandKind::Stats },
    CommandSpec { name: "thresh", aliases: &[], usage: "thresh [percent]", summary: "Set or show the FIFO polling threshold", kind: CommandKind::Thresh },
    CommandSpec { name: "debug", aliases: &[], usage: "debug", summary: "Toggle debug mode", kind: CommandKind::Debug },
    CommandSpec { name: "quiet", aliases: &[], usage: "quiet", summary: "Toggle quiet mode", kind: CommandKind::Quiet },
    CommandSpec { name: "status", aliases: &[], usage: "status", summary: "Show system status information", kind: CommandKind::Status },
    CommandSpec { name: "dump", aliases: &[], usage: "dump [filename]", summary: "Dump crate settings to a file", kind: CommandKind::Dump },
    CommandSpec { name: "pread", aliases: &[], usage: "pread <mod> <chan> <param>", summary: "Read a channel parameter", kind: CommandKind::PRead },
    CommandSpec { name: "pwrite", aliases: &[], usage: "pwrite <mod> <chan> <param> <value>", summary: "Write a channel parameter", kind: CommandKind::PWrite },
    CommandSpec { name: "pmread", aliases: &[], usage: "pmread <mod> <param>", summary: "Read a module parameter", kind: CommandKind::PmRead },
    CommandSpec { name: "pmwrite", aliases: &[], usage: "pmwrite <mod> <param> <value>", summary: "Write a module parameter", kind: CommandKind::PmWrite },
    CommandSpec { name: "adjust_offsets", aliases: &[], usage: "adjust_offsets <mod>", summary: "Adjust the baseline offsets of a module", kind: CommandKind::AdjustOffsets },
    CommandSpec { name: "find_tau", aliases: &[], usage: "find_tau <mod> <chan>", summary: "Find the decay constant of a channel", kind: CommandKind::FindTau },
    CommandSpec { name: "toggle", aliases: &[], usage: "toggle <mod> <chan> <csraBit>", summary: "Toggle a CHANNEL_CSRA bit", kind: CommandKind::Toggle },
    CommandSpec { name: "toggle_bit", aliases: &[], usage: "toggle_bit <mod> <chan> <param> <bit>", summary: "Toggle any parameter bit", kind: CommandKind::ToggleBit },
    CommandSpec { name: "csr_test", aliases: &[], usage: "csr_test <number>", summary: "Decode CHANNEL_CSRA bits of an integer", kind: CommandKind::CsrTest },
    CommandSpec { name: "bit_test", aliases: &[], usage: "bit_test <numBits> <number>", summary: "Show the active bits of an integer", kind: CommandKind::BitTest },
    CommandSpec { name: "get_traces", aliases: &[], usage: "get_traces <mod> <chan> [threshold]", summary: "Capture module traces to /tmp/traces.dat", kind: CommandKind::GetTraces },
    CommandSpec { name: "save", aliases: &[], usage: "save [setFilename]", summary: "Save the DSP parameters", kind: CommandKind::Save },
    CommandSpec { name: "help", aliases: &["h"], usage: "help", summary: "Show this dialogue", kind: CommandKind::Help },
    CommandSpec { name: "quit", aliases: &["exit"], usage: "quit", summary: "Close the program (refused while running)", kind: CommandKind::Quit },
    CommandSpec { name: "kill", aliases: &[], usage: "kill", summary: "Stop any run and close the program", kind: CommandKind::Kill },
];

fn find_command(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|spec| spec.name == name || spec.aliases.contains(&name))
}

/// The operator side of the controller.
pub struct CommandLoop {
    shared: Arc<Shared>,
    requests: mpsc::Sender<RunRequest>,
    state: watch::Receiver<RunState>,
    config: CrateConfig,
}

impl CommandLoop {
    pub fn new(
        shared: Arc<Shared>,
        requests: mpsc::Sender<RunRequest>,
        state: watch::Receiver<RunState>,
        config: CrateConfig,
    ) -> Self {
        Self {
            shared,
            requests,
            state,
            config,
        }
    }

    fn run_state(&self) -> RunState {
        *self.state.borrow()
    }

    async fn send(&self, request: RunRequest) {
        if self.requests.send(request).await.is_err() {
            warn!("run loop is gone, request dropped");
        }
    }

    /// Read operator input until shutdown.
    pub async fn run(mut self) -> CommandExit {
        // SIGTSTP would suspend the process mid-run; acknowledge and ignore.
        if let Ok(mut sigtstp) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::from_raw(libc::SIGTSTP))
        {
            tokio::spawn(async move {
                loop {
                    sigtstp.recv().await;
                    println!("Warning! Received SIGTSTP (ctrl-z) signal.");
                }
            });
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if self.run_state() == RunState::Rebooting {
                            // Any keypress resumes the run loop after a reboot.
                            self.send(RunRequest::Acknowledge).await;
                            continue;
                        }
                        if let Some(exit) = self.dispatch(line.trim()).await {
                            return exit;
                        }
                    }
                    Ok(None) => {
                        println!("Received EOF (ctrl-d) signal. Exiting...");
                        return self.shutdown(true).await.unwrap_or(CommandExit::Clean);
                    }
                    Err(e) => {
                        warn!(error = %e, "terminal read failed");
                        return self.shutdown(true).await.unwrap_or(CommandExit::Clean);
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    if self.run_state().is_mca() {
                        println!("Received SIGINT (ctrl-c) signal. Stopping MCA...");
                        self.send(RunRequest::StopAcq).await;
                    } else {
                        println!("Received SIGINT (ctrl-c) signal. Ignoring signal.");
                    }
                }
            }
        }
    }

    /// Handle one input line. Returns `Some` when the process should exit.
    async fn dispatch(&mut self, line: &str) -> Option<CommandExit> {
        if line.is_empty() {
            return None;
        }

        let command = line.split_whitespace().next().unwrap_or_default();
        let rest = line[command.len()..].trim();
        let arguments: Vec<&str> = rest.split_whitespace().collect();

        if command == "_SIGSEGV_" {
            eprintln!("SEGMENTATION FAULT");
            self.shared.flags.kill_all.store(true, Ordering::Relaxed);
            self.send(RunRequest::KillAll).await;
            self.wait_terminated().await;
            return Some(CommandExit::Fault);
        }

        // Entering any command clears the latched error.
        ControlFlags::set(&self.shared.flags.had_error, false);

        let Some(spec) = find_command(command) else {
            println!("Unknown command '{}'", command);
            return None;
        };
        self.execute(spec, &arguments, rest).await
    }

    async fn execute(
        &mut self,
        spec: &CommandSpec,
        arguments: &[&str],
        rest: &str,
    ) -> Option<CommandExit> {
        use CommandKind::*;

        match spec.kind {
            Run => self.start_acquisition(true, None).await,
            StartAcq => self.start_acquisition(false, None).await,
            TimedRun => {
                let Some(seconds) = arguments.first().and_then(|a| parse_f64(a)) else {
                    self.usage(spec);
                    return None;
                };
                if seconds <= 0.0 {
                    println!("ERROR: Attempted to run for an invalid length of time ({})!", rest);
                    return None;
                }
                self.start_acquisition(true, Some(seconds)).await;
            }
            Stop => {
                if !self.run_state().is_busy() {
                    println!("Acquisition is not running");
                } else {
                    self.send(RunRequest::StopAcq).await;
                }
            }
            Spill => {
                let state = self.run_state();
                if state.is_mca() {
                    println!("Command not available for MCA run");
                } else if !state.is_acq() {
                    println!("Acquisition is not running");
                } else {
                    self.send(RunRequest::ForceSpill).await;
                }
            }
            Shm => {
                let on = ControlFlags::toggle(&self.shared.flags.shm_mode);
                println!("Toggling shared-memory mode {}", on_off(on));
            }
            Debug => {
                let on = ControlFlags::toggle(&self.shared.flags.debug);
                println!("Toggling debug mode {}", on_off(on));
            }
            Quiet => {
                let on = ControlFlags::toggle(&self.shared.flags.quiet);
                println!("Toggling quiet mode {}", on_off(on));
            }
            Mca => self.start_mca(arguments).await,
            Reboot => {
                let state = self.run_state();
                if state.is_mca() {
                    println!("Warning! Cannot reboot while MCA is running");
                } else if state.is_acq() {
                    println!("Warning! Cannot reboot while acquisition running");
                } else {
                    self.send(RunRequest::Reboot).await;
                }
            }
            Fdir => self.set_output_dir(rest),
            Prefix => self.set_prefix(rest),
            Title => self.set_title(rest),
            RunNum => self.set_run_number(rest),
            Stats => {
                let Some(seconds) = arguments.first().and_then(|a| parse_f64(a)) else {
                    self.usage(spec);
                    return None;
                };
                self.shared.settings().stats_interval_secs = seconds;
                if seconds > 0.0 {
                    println!("Stats dump interval set to {} s.", seconds);
                } else {
                    println!("Stats dumps disabled.");
                }
            }
            Thresh => self.set_thresh(arguments),
            Status => self.show_status(),
            Dump => {
                if !self.guard_params_idle() {
                    return None;
                }
                let path = if rest.is_empty() {
                    PathBuf::from("./Fallback.set")
                } else {
                    PathBuf::from(rest)
                };
                self.send(RunRequest::Hardware(HardwareOp::DumpParams { path }))
                    .await;
            }
            PRead | PWrite | PmRead | PmWrite => {
                self.param_io(spec, arguments).await;
            }
            AdjustOffsets => {
                if !self.guard_params_idle() {
                    return None;
                }
                let Some(modules) = arguments.first().and_then(|a| parse_range(a)) else {
                    self.usage(spec);
                    return None;
                };
                self.send(RunRequest::Hardware(HardwareOp::AdjustOffsets { modules }))
                    .await;
            }
            FindTau => {
                if !self.guard_params_idle() {
                    return None;
                }
                let (Some(module), Some(channel)) = (
                    arguments.first().and_then(|a| parse_u32(a)),
                    arguments.get(1).and_then(|a| parse_u32(a)),
                ) else {
                    self.usage(spec);
                    return None;
                };
                self.send(RunRequest::Hardware(HardwareOp::FindTau {
                    module: module as u16,
                    channel: channel as u16,
                }))
                .await;
            }
            Toggle => self.toggle_csra(spec, arguments).await,
            ToggleBit => self.toggle_bit(spec, arguments).await,
            CsrTest => {
                let Some(value) = arguments.first().and_then(|a| parse_u32(a)) else {
                    self.usage(spec);
                    return None;
                };
                println!("  CHANNEL_CSRA = 0x{:08x}", value);
                for (bit, name, set) in params::decode_csra(value) {
                    println!("   {:2} {} - {}", bit, if set { "[x]" } else { "[ ]" }, name);
                }
            }
            BitTest => {
                let (Some(num_bits), Some(value)) = (
                    arguments.first().and_then(|a| parse_u32(a)),
                    arguments.get(1).and_then(|a| parse_u32(a)),
                ) else {
                    self.usage(spec);
                    return None;
                };
                let active = params::active_bits(num_bits.min(32) as u8, value);
                println!(
                    "  {} of the lowest {} bits of 0x{:x} are set:",
                    active.len(),
                    num_bits.min(32),
                    value
                );
                for bit in active {
                    println!("   bit {}", bit);
                }
            }
            GetTraces => self.get_traces(spec, arguments).await,
            Save => {
                if !self.guard_params_idle() {
                    return None;
                }
                let path = if rest.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(rest))
                };
                self.send(RunRequest::Hardware(HardwareOp::SaveDsp { path }))
                    .await;
            }
            Help => {
                println!("  Help:");
                for spec in COMMANDS {
                    println!("   {:<40} - {}", spec.usage, spec.summary);
                }
            }
            Quit => return self.shutdown(false).await,
            Kill => return self.shutdown(true).await,
        }
        None
    }

    fn usage(&self, spec: &CommandSpec) {
        println!("Invalid number of parameters to {}", spec.name);
        println!(" -SYNTAX- {}", spec.usage);
    }

    /// Parameter edits and reads require an idle crate.
    fn guard_params_idle(&self) -> bool {
        if self.run_state().is_busy() {
            println!("Warning! Cannot touch crate parameters while acquisition or MCA is running");
            return false;
        }
        true
    }

    async fn start_acquisition(&self, record: bool, duration: Option<f64>) {
        let state = self.run_state();
        if state.is_mca() {
            println!("Warning! Cannot run acquisition while MCA program is running");
            return;
        }
        if state.is_acq() {
            println!("Acquisition is already running");
            return;
        }
        if let Some(seconds) = duration {
            println!("Running for approximately {} seconds.", seconds);
        }
        self.send(RunRequest::StartAcq { record, duration }).await;
    }

    async fn start_mca(&self, arguments: &[&str]) {
        let state = self.run_state();
        if state.is_mca() {
            println!("MCA program is already running");
            return;
        }
        if state.is_acq() {
            println!("Warning! Cannot run MCA program while acquisition is running");
            return;
        }

        let (seconds, basename) = match arguments.len() {
            0 => (10.0, "mca".to_string()),
            1 => {
                if is_numeric(arguments[0]) {
                    (parse_f64(arguments[0]).unwrap_or(10.0), "mca".to_string())
                } else {
                    // A lone basename means an unbounded run.
                    (0.0, arguments[0].to_string())
                }
            }
            n => {
                if n > 2 {
                    println!("Too many arguments provided to mca! Ignoring additional args.");
                }
                if is_numeric(arguments[0]) {
                    (
                        parse_f64(arguments[0]).unwrap_or(10.0),
                        arguments[1].to_string(),
                    )
                } else if is_numeric(arguments[1]) {
                    (
                        parse_f64(arguments[1]).unwrap_or(10.0),
                        arguments[0].to_string(),
                    )
                } else {
                    println!("mca only accepts a numeric time!");
                    return;
                }
            }
        };

        if seconds > 0.0 {
            println!("Setting up a {} s MCA run into {}.dat", seconds, basename);
        } else {
            println!("Setting up an unbounded MCA run into {}.dat", basename);
        }
        self.send(RunRequest::StartMca { seconds, basename }).await;
    }

    async fn param_io(&self, spec: &CommandSpec, arguments: &[&str]) {
        if arguments.first() == Some(&"help") {
            match spec.kind {
                CommandKind::PRead | CommandKind::PWrite => print_channel_params(),
                _ => print_module_params(),
            }
            return;
        }
        if !self.guard_params_idle() {
            return;
        }

        let op = match spec.kind {
            CommandKind::PRead => {
                let (Some(modules), Some(channels), Some(name)) = (
                    arguments.first().and_then(|a| parse_range(a)),
                    arguments.get(1).and_then(|a| parse_range(a)),
                    arguments.get(2),
                ) else {
                    self.usage(spec);
                    return;
                };
                HardwareOp::ReadChanPar {
                    modules,
                    channels,
                    name: name.to_string(),
                }
            }
            CommandKind::PWrite => {
                let (Some(modules), Some(channels), Some(name), Some(value)) = (
                    arguments.first().and_then(|a| parse_range(a)),
                    arguments.get(1).and_then(|a| parse_range(a)),
                    arguments.get(2),
                    arguments.get(3).and_then(|a| parse_f64(a)),
                ) else {
                    if arguments.len() >= 4 {
                        println!("ERROR: Invalid module, channel or value argument");
                    } else {
                        self.usage(spec);
                    }
                    return;
                };
                HardwareOp::WriteChanPar {
                    modules,
                    channels,
                    name: name.to_string(),
                    value,
                }
            }
            CommandKind::PmRead => {
                let (Some(modules), Some(name)) = (
                    arguments.first().and_then(|a| parse_range(a)),
                    arguments.get(1),
                ) else {
                    self.usage(spec);
                    return;
                };
                HardwareOp::ReadModPar {
                    modules,
                    name: name.to_string(),
                }
            }
            _ => {
                let (Some(modules), Some(name), Some(value)) = (
                    arguments.first().and_then(|a| parse_range(a)),
                    arguments.get(1),
                    arguments.get(2).and_then(|a| parse_u32(a)),
                ) else {
                    if arguments.len() >= 3 {
                        println!("ERROR: Invalid module or value argument");
                    } else {
                        self.usage(spec);
                    }
                    return;
                };
                HardwareOp::WriteModPar {
                    modules,
                    name: name.to_string(),
                    value,
                }
            }
        };
        self.send(RunRequest::Hardware(op)).await;
    }

    async fn toggle_csra(&self, spec: &CommandSpec, arguments: &[&str]) {
        if !self.guard_params_idle() {
            return;
        }
        let (Some(modules), Some(channels), Some(bit)) = (
            arguments.first().and_then(|a| parse_range(a)),
            arguments.get(1).and_then(|a| parse_range(a)),
            arguments.get(2).and_then(|a| parse_u32(a)),
        ) else {
            self.usage(spec);
            println!("  CHANNEL_CSRA bits:");
            for &(bit, name) in params::CSRA_BITS {
                println!("   {:2} - {}", bit, name);
            }
            return;
        };
        if params::csra_bit_name(bit as u8).is_none() {
            println!("ERROR: Invalid CSRA bit: '{}'", bit);
            return;
        }
        self.send(RunRequest::Hardware(HardwareOp::ToggleCsraBit {
            modules,
            channels,
            bit: bit as u8,
        }))
        .await;
    }

    async fn toggle_bit(&self, spec: &CommandSpec, arguments: &[&str]) {
        if !self.guard_params_idle() {
            return;
        }
        let (Some(module), Some(channel), Some(name), Some(bit)) = (
            arguments.first().and_then(|a| parse_u32(a)),
            arguments.get(1).and_then(|a| parse_u32(a)),
            arguments.get(2),
            arguments.get(3).and_then(|a| parse_u32(a)),
        ) else {
            self.usage(spec);
            return;
        };
        if bit > 31 {
            println!("ERROR: Bit number must be below 32");
            return;
        }
        self.send(RunRequest::Hardware(HardwareOp::ToggleBit {
            module: module as u16,
            channel: channel as u16,
            name: name.to_string(),
            bit: bit as u8,
        }))
        .await;
    }

    async fn get_traces(&self, spec: &CommandSpec, arguments: &[&str]) {
        if !self.guard_params_idle() {
            return;
        }
        let (Some(module), Some(channel)) = (
            arguments.first().and_then(|a| parse_u32(a)),
            arguments.get(1).and_then(|a| parse_u32(a)),
        ) else {
            self.usage(spec);
            return;
        };
        if module >= self.config.modules.count as u32 {
            println!("Error! Invalid module specification ({})!", module);
            return;
        }
        if channel >= self.config.modules.channels as u32 {
            println!("Error! Invalid channel specification ({})!", channel);
            return;
        }
        let threshold = match arguments.get(2) {
            None => 0,
            Some(arg) => match parse_f64(arg) {
                Some(value) if value >= 0.0 => value as u32,
                Some(_) => {
                    println!("Cannot set negative threshold!");
                    0
                }
                None => {
                    println!("Invalid threshold specified");
                    return;
                }
            },
        };
        self.send(RunRequest::Hardware(HardwareOp::GetTraces {
            module: module as u16,
            channel: channel as u16,
            threshold,
        }))
        .await;
    }

    fn set_output_dir(&self, rest: &str) {
        if rest.is_empty() {
            println!(
                "Using output directory '{}'.",
                self.shared.settings().output_dir
            );
            return;
        }
        if ControlFlags::get(&self.shared.flags.file_open) {
            println!("Warning: Directory cannot be changed while a file is open!");
            return;
        }

        let mut directory = rest.to_string();
        if !directory.ends_with('/') {
            directory.push('/');
        }

        let mut settings = self.shared.settings();
        settings.output_dir = directory.clone();
        let previous = settings.next_run_number;
        let prefix = settings.file_prefix.clone();
        let path = next_run_file(&mut settings.next_run_number, &prefix, &directory);
        if previous != settings.next_run_number {
            println!(
                "Warning: Run file existed for run {}! Next run number will be {}.",
                previous, settings.next_run_number
            );
        }
        println!("Set output directory to '{}'.", directory);
        println!("Next file will be '{}'.", path.display());
    }

    fn set_prefix(&self, rest: &str) {
        if rest.is_empty() {
            println!(
                "Using output filename prefix '{}'.",
                self.shared.settings().file_prefix
            );
            return;
        }
        if ControlFlags::get(&self.shared.flags.file_open) {
            println!("Warning: Prefix cannot be changed while a file is open!");
            return;
        }

        let mut settings = self.shared.settings();
        settings.file_prefix = rest.to_string();
        settings.next_run_number = 1;
        let directory = settings.output_dir.clone();
        let path = next_run_file(&mut settings.next_run_number, rest, &directory);
        if settings.next_run_number != 1 {
            println!(
                "Warning: Some run files existed! Next run number will be {}.",
                settings.next_run_number
            );
        }
        println!("Set output filename prefix to '{}'.", rest);
        println!("Next file will be '{}'.", path.display());
    }

    fn set_title(&self, rest: &str) {
        if rest.is_empty() {
            println!(
                "Using output file title '{}'.",
                self.shared.settings().output_title
            );
            return;
        }
        if ControlFlags::get(&self.shared.flags.file_open) {
            println!("Warning: Run title cannot be changed while a file is open!");
            return;
        }

        let mut title = strip_quotes(rest).to_string();
        if title.len() > 80 {
            println!(
                "Warning: Title length {} characters too long for ldf format!",
                title.len() - 80
            );
            title.truncate(80);
        }
        self.shared.settings().output_title = title.clone();
        println!("Set run title to '{}'.", title);
    }

    fn set_run_number(&self, rest: &str) {
        if rest.is_empty() {
            let settings = self.shared.settings();
            println!(
                "Next output file run number '{}' for prefix '{}'.",
                settings.next_run_number, settings.file_prefix
            );
            return;
        }
        if ControlFlags::get(&self.shared.flags.file_open) {
            println!("Warning: Run number cannot be changed while a file is open!");
            return;
        }
        let Some(requested) = parse_u32(rest) else {
            println!("ERROR: Invalid run number: '{}'", rest);
            return;
        };

        let mut settings = self.shared.settings();
        settings.next_run_number = requested;
        let prefix = settings.file_prefix.clone();
        let directory = settings.output_dir.clone();
        let path = next_run_file(&mut settings.next_run_number, &prefix, &directory);
        if settings.next_run_number != requested {
            println!("Warning: Run file existed for run {}.", requested);
        }
        println!("Set run number to '{}'.", settings.next_run_number);
        println!("Next file will be '{}'.", path.display());
    }

    fn set_thresh(&self, arguments: &[&str]) {
        if let Some(argument) = arguments.first() {
            match parse_f64(argument) {
                Some(percent) if (0.0..=100.0).contains(&percent) => {
                    let words = self.config.fifo.thresh_words_for(percent);
                    self.shared.settings().thresh_words = words;
                }
                _ => {
                    println!("Invalid FIFO threshold specification");
                    return;
                }
            }
        }
        let words = self.shared.settings().thresh_words;
        let percent = words as f64 / self.config.fifo.capacity_words as f64 * 100.0;
        println!(
            "Polling threshold = {:.1}% ({}/{})",
            percent, words, self.config.fifo.capacity_words
        );
    }

    fn show_status(&self) {
        let flags = &self.shared.flags;
        let state = self.run_state();
        println!("  Run status:");
        println!("   Run state       - {}", state);
        println!("   Acq running     - {}", yes_no(state.is_acq()));
        println!("   Do MCA run      - {}", yes_no(state.is_mca()));
        println!(
            "   Write to disk   - {}",
            yes_no(ControlFlags::get(&flags.record_data))
        );
        println!(
            "   File open       - {}",
            yes_no(ControlFlags::get(&flags.file_open))
        );
        println!(
            "   Had error       - {}",
            yes_no(ControlFlags::get(&flags.had_error))
        );

        let settings = self.shared.settings();
        println!("\n  Options:");
        println!(
            "   Shared memory   - {}",
            yes_no(ControlFlags::get(&flags.shm_mode))
        );
        println!(
            "   Boot fast       - {}",
            yes_no(ControlFlags::get(&flags.boot_fast))
        );
        println!(
            "   Is quiet        - {}",
            yes_no(ControlFlags::get(&flags.quiet))
        );
        println!(
            "   Debug mode      - {}",
            yes_no(ControlFlags::get(&flags.debug))
        );
        println!("   Output path     - {}{}", settings.output_dir, settings.file_prefix);
        println!("   Next run        - {}", settings.next_run_number);
        println!("   FIFO threshold  - {} words", settings.thresh_words);
        println!("   Stats interval  - {} s", settings.stats_interval_secs);
    }

    /// Shut the controller down. `force` (the `kill` path) stops any active
    /// run first; a plain `quit` is refused while something is running.
    async fn shutdown(&mut self, force: bool) -> Option<CommandExit> {
        let state = self.run_state();
        if state.is_busy() {
            if !force {
                if state.is_mca() {
                    println!("Warning! Cannot quit while MCA program is running");
                } else {
                    println!("Warning! Cannot quit while acquisition running");
                }
                return None;
            }
            println!("Sending KILL signal");
        }

        self.shared.flags.kill_all.store(true, Ordering::Relaxed);
        self.send(RunRequest::KillAll).await;
        self.wait_terminated().await;
        Some(CommandExit::Clean)
    }

    async fn wait_terminated(&mut self) {
        while *self.state.borrow() != RunState::Terminated {
            if self.state.changed().await.is_err() {
                break;
            }
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_channel_params() {
    println!("  Valid channel parameters:");
    for name in params::CHANNEL_PARAMS {
        println!("   {}", name);
    }
}

fn print_module_params() {
    println!("  Valid module parameters:");
    for name in params::MODULE_PARAMS {
        println!("   {}", name);
    }
}
