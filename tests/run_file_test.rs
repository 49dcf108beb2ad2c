//! Run-file lifecycle tests: numbering across runs and size-capped rollover

use pixie_daq::output::{next_run_file, OutputFile, EOF_RESERVE};
use std::path::PathBuf;

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pixie-daq-files-{}-{}", tag, std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// After N runs with the same prefix in a fresh directory, the next run
/// number is N + 1.
#[test]
fn run_numbers_advance_monotonically() {
    let dir = temp_dir("numbering");
    let dir_str = dir.to_str().unwrap().to_string();
    let mut output = OutputFile::new();
    let mut next_run = 1u32;

    for expected in 1..=3u32 {
        next_run_file(&mut next_run, "test", &dir_str);
        assert_eq!(next_run, expected);

        output
            .open_new_file("numbering", next_run, "test", &dir_str, false)
            .unwrap();
        output.write(&[0xCAFE; 64]).unwrap();
        output.close().unwrap();

        // What the controller does on every non-continue close.
        next_run_file(&mut next_run, "test", &dir_str);
    }

    assert_eq!(next_run, 4);
    for run in 1..=3 {
        assert!(dir.join(format!("test_{}.ldf", run)).exists());
    }

    std::fs::remove_dir_all(&dir).ok();
}

/// Rolling over the size cap must produce sub-files whose payloads
/// reconstruct to the exact written stream, with no spill straddling a file
/// boundary.
#[test]
fn rollover_reconstructs_a_contiguous_stream() {
    let dir = temp_dir("rollover");
    let dir_str = dir.to_str().unwrap().to_string();

    const TITLE: &str = "rollover";
    let head_size = 12 + TITLE.len() as u64; // multiple of 4 already
    let cap = EOF_RESERVE + head_size + 3 * 1024;

    let mut output = OutputFile::with_max_size(cap);
    output
        .open_new_file(TITLE, 9, "seg", &dir_str, false)
        .unwrap();

    let mut written: Vec<u32> = Vec::new();
    let mut rollovers = 0;
    for spill_index in 0..10u32 {
        let spill: Vec<u32> = (0..256).map(|i| (spill_index << 16) | i).collect();
        if output.would_exceed(spill.len()) {
            output.close().unwrap();
            output
                .open_new_file(TITLE, 9, "seg", &dir_str, true)
                .unwrap();
            rollovers += 1;
        }
        output.write(&spill).unwrap();
        written.extend_from_slice(&spill);
    }
    output.close().unwrap();

    assert!(rollovers >= 1, "cap was never reached");
    assert_eq!(output.run_number(), 9);
    assert_eq!(output.sub_file(), rollovers);

    // Reassemble the payloads of every sub-file in order.
    let mut recovered: Vec<u32> = Vec::new();
    for sub_file in 0..=rollovers {
        let name = if sub_file == 0 {
            "seg_9.ldf".to_string()
        } else {
            format!("seg_9_{}.ldf", sub_file)
        };
        let bytes = std::fs::read(dir.join(&name)).unwrap();
        assert!(bytes.len() as u64 <= cap, "{} exceeds the size cap", name);
        let data = &bytes[head_size as usize..bytes.len() - EOF_RESERVE as usize];
        // Whole spills only: no event straddles a file boundary.
        assert_eq!(data.len() % 1024, 0);
        for chunk in data.chunks_exact(4) {
            recovered.push(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
    }

    assert_eq!(recovered, written);
    std::fs::remove_dir_all(&dir).ok();
}
