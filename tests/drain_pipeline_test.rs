//! Drain-cycle tests against scripted FIFO contents
//!
//! Words are injected straight into the emulated interface, so every spill
//! outcome (framing, partial-event carry, corruption, overflow) is exact and
//! deterministic.

use pixie_daq::config::CrateConfig;
use pixie_daq::hardware::{BootMode, EmulatedInterface, Interface};
use pixie_daq::spill::{DrainError, SpillDrainer};
use pixie_daq::stats::StatsHandler;

fn config() -> CrateConfig {
    CrateConfig::default()
}

fn setup(config: &CrateConfig) -> (EmulatedInterface, SpillDrainer, StatsHandler) {
    let mut pif = EmulatedInterface::with_seed(config, 3);
    pif.init().unwrap();
    pif.boot(BootMode::Complete).unwrap();
    let drainer = SpillDrainer::new(
        config.modules.slot_map.clone(),
        config.fifo.capacity_words,
        config.fifo.min_read_words,
        config.fifo.poll_tries,
    );
    let stats = StatsHandler::new(config.modules.count, config.modules.channels);
    (pif, drainer, stats)
}

/// One list-mode event with the given slot/channel and total word count.
fn event(slot: u16, channel: u16, length: usize) -> Vec<u32> {
    let mut words = vec![EmulatedInterface::event_header(slot, channel, length)];
    words.extend((1..length).map(|i| 0xA000_0000 | i as u32));
    words
}

/// Check the per-module framing invariant: the spill sizes in the module
/// headers add up to the total word count.
fn framing_sizes(spill: &[u32]) -> Vec<(u32, u32)> {
    let mut sections = Vec::new();
    let mut cursor = 0usize;
    while cursor < spill.len() {
        let size = spill[cursor];
        let module = spill[cursor + 1];
        assert!(size >= 2, "spill size below header size");
        sections.push((size, module));
        cursor += size as usize;
    }
    assert_eq!(cursor, spill.len(), "framing does not cover the spill");
    sections
}

#[test]
fn empty_modules_emit_header_only_records() {
    let config = config();
    let (mut pif, mut drainer, mut stats) = setup(&config);

    // Below the threshold and not forced: no spill at all.
    assert!(drainer
        .drain(&mut pif, 10_000, false, &mut stats)
        .unwrap()
        .is_none());

    // Forced with nothing pending: every module contributes `{2, mod}`.
    let spill = drainer
        .drain(&mut pif, 10_000, true, &mut stats)
        .unwrap()
        .expect("forced spill")
        .to_vec();
    assert_eq!(spill, vec![2, 0, 2, 1]);
}

#[test]
fn spill_framing_sums_to_total_words() {
    let config = config();
    let (mut pif, mut drainer, mut stats) = setup(&config);

    let mut stream = Vec::new();
    stream.extend(event(2, 0, 4));
    stream.extend(event(2, 7, 6));
    stream.extend(event(2, 15, 4));
    pif.inject_fifo_words(0, &stream);
    pif.inject_fifo_words(1, &event(3, 2, 12));

    let spill = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .unwrap()
        .expect("spill")
        .to_vec();

    let sections = framing_sizes(&spill);
    assert_eq!(sections, vec![(16, 0), (14, 1)]);
    assert_eq!(stats.channel_events(0, 0), 1);
    assert_eq!(stats.channel_events(0, 7), 1);
    assert_eq!(stats.channel_events(1, 2), 1);
    // 4 bytes per word over all parsed events.
    assert_eq!(stats.total_bytes(), 4 * (4 + 6 + 4 + 12));
}

#[test]
fn partial_event_carries_into_the_next_spill_without_loss() {
    let config = config();
    let (mut pif, mut drainer, mut stats) = setup(&config);

    // First drain: one whole event plus an 8-word event cut 3 words short.
    let whole = event(2, 1, 4);
    let split = event(2, 2, 8);
    let mut first_stream = whole.clone();
    first_stream.extend_from_slice(&split[..5]);
    pif.inject_fifo_words(0, &first_stream);

    let first_spill = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .unwrap()
        .expect("first spill")
        .to_vec();

    // The fragment is withheld from the emitted spill and carried.
    assert_eq!(drainer.partial_words(0), 5);
    let first_payload = &first_spill[2..first_spill.len() - 2];
    assert_eq!(first_payload, &whole[..]);
    // Only the whole event has been counted so far.
    assert_eq!(stats.channel_events(0, 2), 0);

    // Second drain: the missing 3 words plus two more events.
    let tail = event(2, 3, 4);
    let extra = event(2, 4, 4);
    let mut second_stream = split[5..].to_vec();
    second_stream.extend_from_slice(&tail);
    second_stream.extend_from_slice(&extra);
    pif.inject_fifo_words(0, &second_stream);

    let second_spill = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .unwrap()
        .expect("second spill")
        .to_vec();

    assert_eq!(drainer.partial_words(0), 0);
    let second_payload = &second_spill[2..second_spill.len() - 2];

    // Zero loss, zero duplication: the concatenation of emitted payloads
    // equals the injected stream exactly.
    let mut emitted = first_payload.to_vec();
    emitted.extend_from_slice(second_payload);
    let mut injected = first_stream.clone();
    injected.extend_from_slice(&second_stream);
    assert_eq!(emitted, injected);

    // The split event is counted exactly once, when it completed.
    assert_eq!(stats.channel_events(0, 2), 1);
}

#[test]
fn zero_event_size_aborts_with_diagnostic_context() {
    let config = config();
    let (mut pif, mut drainer, mut stats) = setup(&config);

    let mut stream = event(2, 1, 4);
    stream.push(EmulatedInterface::event_header(2, 3, 0));
    stream.extend(event(2, 4, 4));
    pif.inject_fifo_words(0, &stream);

    let error = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .expect_err("zero event size must abort the drain");
    match error {
        DrainError::Corrupt { module, report } => {
            assert_eq!(module, 0);
            let text = report.to_string();
            assert!(text.contains("zero event size"));
            assert!(text.contains("Event prior to parsing error (4 words)"));
            assert!(text.contains("Event at parsing error (0 words)"));
            assert!(text.contains("Event after parsing error"));
        }
        other => panic!("expected corruption, got {:?}", other),
    }
}

#[test]
fn wrong_slot_aborts_the_run() {
    let config = config();
    let (mut pif, mut drainer, mut stats) = setup(&config);

    // Module 0 expects slot 2; present slot 4.
    pif.inject_fifo_words(0, &event(4, 1, 4));
    pif.inject_fifo_words(0, &event(4, 1, 4));
    pif.inject_fifo_words(0, &[0; 4]); // pad over the minimum read

    let error = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .expect_err("slot mismatch must abort the drain");
    assert!(matches!(error, DrainError::Corrupt { module: 0, .. }));
}

#[test]
fn full_fifo_is_fatal() {
    let mut config = config();
    config.fifo.capacity_words = 1024;
    let (mut pif, mut drainer, mut stats) = setup(&config);

    pif.inject_fifo_words(0, &vec![0u32; 1024]);
    let error = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .expect_err("full FIFO must abort the drain");
    match error {
        DrainError::FifoOverflow {
            module,
            words,
            capacity,
        } => {
            assert_eq!(module, 0);
            assert_eq!(words, 1024);
            assert_eq!(capacity, 1024);
        }
        other => panic!("expected overflow, got {:?}", other),
    }
}

#[test]
fn large_read_below_capacity_parses_cleanly() {
    let config = config();
    assert_eq!(config.fifo.capacity_words, 131_072);
    let (mut pif, mut drainer, mut stats) = setup(&config);

    // Exactly 16382 words: 4095 four-word events and one two-word event.
    let mut stream = Vec::with_capacity(16_382);
    for _ in 0..4095 {
        stream.extend(event(2, 5, 4));
    }
    stream.extend(event(2, 6, 2));
    assert_eq!(stream.len(), 16_382);
    pif.inject_fifo_words(0, &stream);

    let spill = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .unwrap()
        .expect("spill")
        .to_vec();

    let sections = framing_sizes(&spill);
    assert_eq!(sections[0], (16_384, 0));
    assert_eq!(stats.channel_events(0, 5), 4095);
    assert_eq!(stats.channel_events(0, 6), 1);
}

#[test]
fn below_minimum_read_keeps_words_in_the_fifo() {
    let config = config();
    let (mut pif, mut drainer, mut stats) = setup(&config);

    // 8 words is below the 9-word minimum read.
    pif.inject_fifo_words(0, &event(2, 0, 4));
    pif.inject_fifo_words(0, &event(2, 1, 4)[..4].to_vec());

    let spill = drainer
        .drain(&mut pif, 0, false, &mut stats)
        .unwrap()
        .expect("spill")
        .to_vec();
    assert_eq!(spill, vec![2, 0, 2, 1]);
    // Nothing was consumed.
    assert_eq!(pif.check_fifo_words(0).unwrap(), 8);
}
