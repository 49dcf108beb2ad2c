//! Emulated crate interface
//!
//! Generates a synthetic list-mode word stream and histogram data so the
//! whole controller can run without modules present. The stream is produced
//! at word granularity: a FIFO count can land in the middle of an event,
//! which exercises the partial-event carry exactly like real hardware.

use super::{BootMode, HardwareError, Interface, ModuleInfo};
use crate::common::Word;
use crate::config::CrateConfig;
use crate::hardware::params;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

const TRACE_SAMPLES: usize = 8192;
const HISTOGRAM_BINS: usize = 16384;

/// Default synthetic data rate per module, in words per second.
const DEFAULT_WORDS_PER_SEC: f64 = 20_000.0;

/// Per-module synthetic stream state.
struct ModuleState {
    /// Words visible to `check_fifo_words`/`read_fifo_words`.
    fifo: VecDeque<Word>,
    /// Whole events generated ahead of the FIFO cursor.
    staging: VecDeque<Word>,
    last_pump: Instant,
    /// Fractional words owed from the previous pump.
    word_debt: f64,
}

impl ModuleState {
    fn new() -> Self {
        Self {
            fifo: VecDeque::new(),
            staging: VecDeque::new(),
            last_pump: Instant::now(),
            word_debt: 0.0,
        }
    }
}

/// Software stand-in for a crate of Pixie-16 style modules.
pub struct EmulatedInterface {
    num_modules: u16,
    num_channels: u16,
    slot_map: Vec<u16>,
    fifo_capacity: usize,

    initialized: bool,
    booted: bool,
    list_mode: bool,
    histogram_mode: bool,

    modules: Vec<ModuleState>,
    words_per_sec: f64,
    timestamp: u64,

    chan_params: HashMap<(u16, u16, String), f64>,
    mod_params: HashMap<(u16, String), Word>,
    histograms: Vec<Vec<Word>>,
    traces: Vec<Vec<u16>>,
    rates: Vec<(f64, f64)>,

    rng: StdRng,
    energy: Normal<f64>,
}

impl EmulatedInterface {
    pub fn new(config: &CrateConfig) -> Self {
        Self::with_seed(config, rand::thread_rng().gen())
    }

    /// Deterministic construction for tests.
    pub fn with_seed(config: &CrateConfig, seed: u64) -> Self {
        let n_mod = config.modules.count;
        let n_chan = config.modules.channels;
        Self {
            num_modules: n_mod,
            num_channels: n_chan,
            slot_map: config.modules.slot_map.clone(),
            fifo_capacity: config.fifo.capacity_words,
            initialized: false,
            booted: false,
            list_mode: false,
            histogram_mode: false,
            modules: (0..n_mod).map(|_| ModuleState::new()).collect(),
            words_per_sec: DEFAULT_WORDS_PER_SEC,
            timestamp: 0,
            chan_params: HashMap::new(),
            mod_params: HashMap::new(),
            histograms: vec![vec![0; HISTOGRAM_BINS]; n_mod as usize * n_chan as usize],
            traces: vec![vec![0; TRACE_SAMPLES]; n_mod as usize * n_chan as usize],
            rates: vec![(0.0, 0.0); n_mod as usize * n_chan as usize],
            rng: StdRng::seed_from_u64(seed),
            energy: Normal::new(2000.0, 180.0).expect("valid distribution"),
        }
    }

    /// Change the synthetic data rate (words per second per module).
    pub fn set_words_per_sec(&mut self, rate: f64) {
        self.words_per_sec = rate.max(0.0);
    }

    /// Push raw words straight into a module's FIFO. Test stimulus.
    pub fn inject_fifo_words(&mut self, module: u16, words: &[Word]) {
        self.modules[module as usize].fifo.extend(words.iter().copied());
    }

    /// Encode a list-mode event header word.
    pub fn event_header(slot: u16, channel: u16, event_len: usize) -> Word {
        (channel as Word & 0xF)
            | ((slot as Word & 0xF) << 4)
            | (4 << 12)
            | ((event_len as Word & 0x3FFF) << 17)
    }

    fn check_module(&self, module: u16) -> Result<(), HardwareError> {
        if module >= self.num_modules {
            return Err(HardwareError::InvalidModule(module));
        }
        Ok(())
    }

    fn check_channel(&self, module: u16, channel: u16) -> Result<(), HardwareError> {
        self.check_module(module)?;
        if channel >= self.num_channels {
            return Err(HardwareError::InvalidChannel { module, channel });
        }
        Ok(())
    }

    fn hist_index(&self, module: u16, channel: u16) -> usize {
        module as usize * self.num_channels as usize + channel as usize
    }

    /// Generate one whole event into the module's staging queue.
    fn generate_event(&mut self, module: u16) {
        let slot = self.slot_map[module as usize];
        let channel = self.rng.gen_range(0..self.num_channels.min(16));
        let event_len = 4;
        let energy = self.energy.sample(&mut self.rng).clamp(0.0, 65535.0) as Word;
        self.timestamp = self.timestamp.wrapping_add(self.rng.gen_range(100..10_000));

        let staging = &mut self.modules[module as usize].staging;
        staging.push_back(Self::event_header(slot, channel, event_len));
        staging.push_back(self.timestamp as Word);
        staging.push_back((self.timestamp >> 32) as Word & 0xFFFF);
        staging.push_back(energy & 0xFFFF);
    }

    /// Move elapsed-time worth of words from the generator into the FIFO.
    fn pump(&mut self, module: u16) {
        if !self.list_mode {
            return;
        }
        let now = Instant::now();
        let elapsed = now
            .duration_since(self.modules[module as usize].last_pump)
            .as_secs_f64();
        self.modules[module as usize].last_pump = now;

        let owed = elapsed * self.words_per_sec + self.modules[module as usize].word_debt;
        let mut words = owed as usize;
        self.modules[module as usize].word_debt = owed - words as f64;

        while self.modules[module as usize].staging.len() < words {
            self.generate_event(module);
        }

        let state = &mut self.modules[module as usize];
        // The hardware FIFO saturates at capacity; the drain reports a full
        // FIFO as an overflow, so nothing is generated past that point.
        words = words.min(self.fifo_capacity.saturating_sub(state.fifo.len()));
        for _ in 0..words {
            match state.staging.pop_front() {
                Some(word) => state.fifo.push_back(word),
                None => break,
            }
        }
    }
}

impl Interface for EmulatedInterface {
    fn init(&mut self) -> Result<(), HardwareError> {
        if self.initialized {
            return Err(HardwareError::Boot("interface initialized twice".into()));
        }
        self.initialized = true;
        info!(
            modules = self.num_modules,
            channels = self.num_channels,
            "emulated interface initialized"
        );
        Ok(())
    }

    fn boot(&mut self, mode: BootMode) -> Result<(), HardwareError> {
        if !self.initialized {
            return Err(HardwareError::NotBooted);
        }
        self.booted = true;
        self.list_mode = false;
        self.histogram_mode = false;
        for state in &mut self.modules {
            state.fifo.clear();
            state.staging.clear();
        }
        info!(?mode, "emulated modules booted");
        Ok(())
    }

    fn num_modules(&self) -> u16 {
        self.num_modules
    }

    fn num_channels(&self) -> u16 {
        self.num_channels
    }

    fn slot_number(&self, module: u16) -> Result<u16, HardwareError> {
        self.check_module(module)?;
        Ok(self.slot_map[module as usize])
    }

    fn module_info(&self, module: u16) -> Result<ModuleInfo, HardwareError> {
        self.check_module(module)?;
        Ok(ModuleInfo {
            revision: 0xF,
            serial_number: 1000 + module as u32,
            adc_bits: 14,
            adc_msps: 250,
        })
    }

    fn read_mod_par(&mut self, name: &str, module: u16) -> Result<Word, HardwareError> {
        self.check_module(module)?;
        if !params::is_module_param(name) {
            return Err(HardwareError::UnknownParameter(name.to_string()));
        }
        Ok(self
            .mod_params
            .get(&(module, name.to_string()))
            .copied()
            .unwrap_or(0))
    }

    fn write_mod_par(&mut self, name: &str, value: Word, module: u16)
        -> Result<(), HardwareError> {
        self.check_module(module)?;
        if !params::is_module_param(name) {
            return Err(HardwareError::UnknownParameter(name.to_string()));
        }
        self.mod_params.insert((module, name.to_string()), value);
        Ok(())
    }

    fn read_chan_par(&mut self, name: &str, module: u16, channel: u16)
        -> Result<f64, HardwareError> {
        self.check_channel(module, channel)?;
        if !params::is_channel_param(name) {
            return Err(HardwareError::UnknownParameter(name.to_string()));
        }
        Ok(self
            .chan_params
            .get(&(module, channel, name.to_string()))
            .copied()
            .unwrap_or(0.0))
    }

    fn write_chan_par(
        &mut self,
        name: &str,
        value: f64,
        module: u16,
        channel: u16,
    ) -> Result<(), HardwareError> {
        self.check_channel(module, channel)?;
        if !params::is_channel_param(name) {
            return Err(HardwareError::UnknownParameter(name.to_string()));
        }
        self.chan_params
            .insert((module, channel, name.to_string()), value);
        Ok(())
    }

    fn save_dsp_parameters(&mut self, path: Option<&Path>) -> Result<(), HardwareError> {
        if let Some(path) = path {
            let mut file = std::fs::File::create(path)?;
            for ((module, channel, name), value) in &self.chan_params {
                writeln!(file, "{} {} {} {}", module, channel, name, value)?;
            }
            for ((module, name), value) in &self.mod_params {
                writeln!(file, "{} {} {}", module, name, value)?;
            }
        }
        debug!("DSP parameters saved");
        Ok(())
    }

    fn adjust_offsets(&mut self, module: u16) -> Result<(), HardwareError> {
        self.check_module(module)?;
        for channel in 0..self.num_channels {
            let offset = self.rng.gen_range(-0.05..0.05);
            self.chan_params
                .insert((module, channel, "VOFFSET".to_string()), offset);
        }
        Ok(())
    }

    fn find_tau(&mut self, module: u16, channel: u16) -> Result<f64, HardwareError> {
        self.check_channel(module, channel)?;
        let stored = self
            .chan_params
            .get(&(module, channel, "TAU".to_string()))
            .copied()
            .unwrap_or(50.0);
        Ok(stored + self.rng.gen_range(-0.5..0.5))
    }

    fn acquire_traces(&mut self, module: u16) -> Result<(), HardwareError> {
        self.check_module(module)?;
        for channel in 0..self.num_channels {
            let baseline = 400.0 + self.rng.gen_range(-10.0..10.0);
            let pulse_at = self.rng.gen_range(100..TRACE_SAMPLES / 2);
            let amplitude = self.energy.sample(&mut self.rng).clamp(0.0, 16000.0);
            let index = self.hist_index(module, channel);
            for (sample, value) in self.traces[index].iter_mut().enumerate() {
                let mut level = baseline + self.rng.gen_range(-3.0..3.0);
                if sample >= pulse_at {
                    let decay = (-((sample - pulse_at) as f64) / 300.0).exp();
                    level += amplitude * decay;
                }
                *value = level.clamp(0.0, 65535.0) as u16;
            }
        }
        Ok(())
    }

    fn read_chan_trace(
        &mut self,
        buf: &mut [u16],
        module: u16,
        channel: u16,
    ) -> Result<(), HardwareError> {
        self.check_channel(module, channel)?;
        let index = self.hist_index(module, channel);
        let n = buf.len().min(TRACE_SAMPLES);
        buf[..n].copy_from_slice(&self.traces[index][..n]);
        Ok(())
    }

    fn trace_length(&self) -> usize {
        TRACE_SAMPLES
    }

    fn start_list_mode_run(&mut self) -> Result<(), HardwareError> {
        if !self.booted {
            return Err(HardwareError::NotBooted);
        }
        if self.histogram_mode {
            return Err(HardwareError::Run("histogram run active".into()));
        }
        self.list_mode = true;
        let now = Instant::now();
        for state in &mut self.modules {
            state.last_pump = now;
            state.word_debt = 0.0;
        }
        Ok(())
    }

    fn start_histogram_run(&mut self) -> Result<(), HardwareError> {
        if !self.booted {
            return Err(HardwareError::NotBooted);
        }
        if self.list_mode {
            return Err(HardwareError::Run("list-mode run active".into()));
        }
        self.histogram_mode = true;
        for histogram in &mut self.histograms {
            histogram.iter_mut().for_each(|bin| *bin = 0);
        }
        Ok(())
    }

    fn remove_preset_run_length(&mut self, module: u16) -> Result<(), HardwareError> {
        self.check_module(module)?;
        self.mod_params.insert((module, "HOST_RT_PRESET".into()), 0);
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), HardwareError> {
        self.list_mode = false;
        self.histogram_mode = false;
        Ok(())
    }

    fn check_run_status(&mut self, module: u16) -> Result<bool, HardwareError> {
        self.check_module(module)?;
        Ok(self.list_mode || self.histogram_mode)
    }

    fn check_fifo_words(&mut self, module: u16) -> Result<usize, HardwareError> {
        self.check_module(module)?;
        self.pump(module);
        Ok(self.modules[module as usize].fifo.len())
    }

    fn read_fifo_words(&mut self, buf: &mut [Word], module: u16) -> Result<(), HardwareError> {
        self.check_module(module)?;
        let fifo = &mut self.modules[module as usize].fifo;
        if buf.len() > fifo.len() {
            return Err(HardwareError::FifoRead {
                module,
                reason: format!("requested {} words, {} available", buf.len(), fifo.len()),
            });
        }
        for word in buf.iter_mut() {
            *word = fifo.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn get_statistics(&mut self, module: u16) -> Result<(), HardwareError> {
        self.check_module(module)?;
        let events_per_sec = self.words_per_sec / 4.0 / self.num_channels as f64;
        for channel in 0..self.num_channels {
            let icr = events_per_sec * self.rng.gen_range(0.9..1.1);
            let ocr = icr * self.rng.gen_range(0.85..1.0);
            let index = self.hist_index(module, channel);
            self.rates[index] = (icr, ocr);
        }
        Ok(())
    }

    fn input_count_rate(&self, module: u16, channel: u16) -> f64 {
        self.rates[self.hist_index(module, channel)].0
    }

    fn output_count_rate(&self, module: u16, channel: u16) -> f64 {
        self.rates[self.hist_index(module, channel)].1
    }

    fn read_histogram(
        &mut self,
        buf: &mut [Word],
        module: u16,
        channel: u16,
    ) -> Result<(), HardwareError> {
        self.check_channel(module, channel)?;
        if !self.histogram_mode {
            return Err(HardwareError::Run("no histogram run active".into()));
        }
        // Accumulate a fresh burst of counts, then snapshot.
        let index = self.hist_index(module, channel);
        let center = 2000.0 + channel as f64 * 50.0;
        let shape = Normal::new(center, 120.0).expect("valid distribution");
        for _ in 0..64 {
            let bin = shape.sample(&mut self.rng).clamp(0.0, (HISTOGRAM_BINS - 1) as f64);
            self.histograms[index][bin as usize] += 1;
        }
        let n = buf.len().min(HISTOGRAM_BINS);
        buf[..n].copy_from_slice(&self.histograms[index][..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator() -> EmulatedInterface {
        let config = CrateConfig::default();
        let mut pif = EmulatedInterface::with_seed(&config, 7);
        pif.init().unwrap();
        pif.boot(BootMode::Complete).unwrap();
        pif
    }

    #[test]
    fn double_init_is_rejected() {
        let config = CrateConfig::default();
        let mut pif = EmulatedInterface::with_seed(&config, 7);
        pif.init().unwrap();
        assert!(pif.init().is_err());
    }

    #[test]
    fn event_header_round_trips_fields() {
        let header = EmulatedInterface::event_header(3, 9, 4);
        assert_eq!(header & 0xF, 9);
        assert_eq!((header >> 4) & 0xF, 3);
        assert_eq!((header & 0x7FFE_0000) >> 17, 4);
    }

    #[test]
    fn injected_words_are_read_back() {
        let mut pif = emulator();
        pif.inject_fifo_words(0, &[1, 2, 3, 4]);
        assert_eq!(pif.check_fifo_words(0).unwrap(), 4);
        let mut buf = [0u32; 4];
        pif.read_fifo_words(&mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(pif.check_fifo_words(0).unwrap(), 0);
    }

    #[test]
    fn short_read_of_empty_fifo_fails() {
        let mut pif = emulator();
        let mut buf = [0u32; 8];
        assert!(pif.read_fifo_words(&mut buf, 0).is_err());
    }

    #[test]
    fn list_mode_produces_words_over_time() {
        let mut pif = emulator();
        pif.set_words_per_sec(1_000_000.0);
        pif.start_list_mode_run().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(pif.check_fifo_words(0).unwrap() > 0);
        pif.end_run().unwrap();
        assert!(!pif.check_run_status(0).unwrap());
    }

    #[test]
    fn parameters_persist_and_validate() {
        let mut pif = emulator();
        pif.write_chan_par("TAU", 42.5, 0, 3).unwrap();
        assert_eq!(pif.read_chan_par("TAU", 0, 3).unwrap(), 42.5);
        assert!(pif.write_chan_par("NOT_A_PARAM", 1.0, 0, 0).is_err());

        pif.write_mod_par("MODULE_CSRA", 0x41, 1).unwrap();
        assert_eq!(pif.read_mod_par("MODULE_CSRA", 1).unwrap(), 0x41);
        assert!(pif.read_mod_par("TAU", 0).is_err());
    }

    #[test]
    fn histogram_accumulates_counts() {
        let mut pif = emulator();
        pif.start_histogram_run().unwrap();
        let mut buf = vec![0u32; HISTOGRAM_BINS];
        pif.read_histogram(&mut buf, 0, 0).unwrap();
        let first: u64 = buf.iter().map(|&b| b as u64).sum();
        pif.read_histogram(&mut buf, 0, 0).unwrap();
        let second: u64 = buf.iter().map(|&b| b as u64).sum();
        assert!(first > 0);
        assert!(second > first);
    }

    #[test]
    fn runs_are_mutually_exclusive() {
        let mut pif = emulator();
        pif.start_list_mode_run().unwrap();
        assert!(pif.start_histogram_run().is_err());
        pif.end_run().unwrap();
        pif.start_histogram_run().unwrap();
        assert!(pif.start_list_mode_run().is_err());
    }
}
