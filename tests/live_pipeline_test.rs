//! End-to-end pipeline over the emulated interface's live stream
//!
//! Runs list mode on the emulator, drains real spills, records them to a run
//! file and broadcasts them in chunked mode, then verifies the recorded
//! byte stream and the reassembled datagrams.

use pixie_daq::broadcast::{BroadcastClient, SPILL_CHUNK_WORDS};
use pixie_daq::config::CrateConfig;
use pixie_daq::hardware::{BootMode, EmulatedInterface, Interface};
use pixie_daq::output::{OutputFile, EOF_RESERVE};
use pixie_daq::spill::SpillDrainer;
use pixie_daq::stats::StatsHandler;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::time::Duration;

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pixie-daq-live-{}-{}", tag, std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn live_stream_records_and_broadcasts_consistently() {
    let config = CrateConfig::default();
    let mut pif = EmulatedInterface::with_seed(&config, 42);
    pif.set_words_per_sec(400_000.0);
    pif.init().unwrap();
    pif.boot(BootMode::Complete).unwrap();

    let mut drainer = SpillDrainer::new(
        config.modules.slot_map.clone(),
        config.fifo.capacity_words,
        config.fifo.min_read_words,
        config.fifo.poll_tries,
    );
    let mut stats = StatsHandler::new(config.modules.count, config.modules.channels);

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let client = BroadcastClient::new(&receiver.local_addr().unwrap().to_string()).unwrap();

    let dir = temp_dir("stream");
    let dir_str = dir.to_str().unwrap().to_string();
    let mut output = OutputFile::new();
    output
        .open_new_file("live pipeline test", 1, "live", &dir_str, false)
        .unwrap();

    pif.start_list_mode_run().unwrap();

    let mut recorded: Vec<u32> = Vec::new();
    let mut spills = 0;
    while spills < 3 {
        std::thread::sleep(Duration::from_millis(20));
        match drainer.drain(&mut pif, 1000, false, &mut stats).unwrap() {
            None => continue,
            Some(spill) => {
                let spill = spill.to_vec();
                output.write(&spill).unwrap();
                client.send_spill(&spill).unwrap();
                recorded.extend_from_slice(&spill);
                spills += 1;

                // Reassemble this spill's datagrams and compare.
                let expected_chunks = spill.len().div_ceil(SPILL_CHUNK_WORDS);
                let mut reassembled = Vec::new();
                for chunk in 1..=expected_chunks {
                    let mut buf = vec![0u8; 65536];
                    let n = receiver.recv(&mut buf).unwrap();
                    let index = u32::from_le_bytes(buf[0..4].try_into().unwrap());
                    let total = u32::from_le_bytes(buf[4..8].try_into().unwrap());
                    assert_eq!(index, chunk as u32);
                    assert_eq!(total, expected_chunks as u32);
                    for bytes in buf[8..n].chunks_exact(4) {
                        reassembled.push(u32::from_le_bytes(bytes.try_into().unwrap()));
                    }
                }
                assert_eq!(reassembled, spill);
            }
        }
    }

    pif.end_run().unwrap();
    let head_size = output.size() - 4 * recorded.len() as u64;
    output.close().unwrap();

    assert!(stats.total_bytes() > 0);

    // The file holds exactly the emitted stream between head and EOF.
    let path = dir.join("live_1.ldf");
    let bytes = std::fs::read(&path).unwrap();
    let data = &bytes[head_size as usize..bytes.len() - EOF_RESERVE as usize];
    let mut words = Vec::new();
    for chunk in data.chunks_exact(4) {
        words.push(u32::from_le_bytes(chunk.try_into().unwrap()));
    }
    assert_eq!(words, recorded);

    // Per-module framing covers every emitted spill.
    let mut cursor = 0usize;
    let mut modules_seen = 0;
    while cursor < words.len() {
        let size = words[cursor] as usize;
        let module = words[cursor + 1];
        assert!(size >= 2);
        assert!(module < config.modules.count as u32);
        cursor += size;
        modules_seen += 1;
    }
    assert_eq!(cursor, words.len());
    assert_eq!(modules_seen, 3 * config.modules.count as usize);

    std::fs::remove_dir_all(&dir).ok();
}
