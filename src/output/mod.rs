//! Run-file writer
//!
//! Append-only .ldf-style files named `{prefix}_{run}[_{sub}].ldf`. Each file
//! is capped at 2 GiB with 65552 bytes reserved for the two EOF buffers
//! written at close time; when a write would cross the cap the controller
//! rolls to the next sub-file of the same run. Debug mode replaces all I/O
//! with synthetic size accounting.
//!
//! File layout: a HEAD record (magic, run number, title), the packed spill
//! words exactly as drained, then two EOF buffers of 8194 words each.

use crate::broadcast::BroadcastClient;
use crate::common::Word;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Maximum allowable run-file size in bytes (2 GiB).
pub const MAX_FILE_SIZE: u64 = 2_147_483_648;

/// Bytes reserved for the two EOF buffers (2 × 8194 words × 4 bytes).
pub const EOF_RESERVE: u64 = 65_552;

const EOF_BUFFER_WORDS: usize = 8194;
const EOF_MARKER: Word = 0x2046_4F45; // "EOF " little-endian
const HEAD_MARKER: Word = 0x4441_4548; // "HEAD" little-endian

/// Output-file errors
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("no output file is open")]
    NotOpen,

    #[error("an output file is already open")]
    AlreadyOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// File name for a run, with the sub-file counter suffixed after rollovers.
pub fn run_file_name(prefix: &str, run_number: u32, sub_file: u32) -> String {
    if sub_file == 0 {
        format!("{}_{}.ldf", prefix, run_number)
    } else {
        format!("{}_{}_{}.ldf", prefix, run_number, sub_file)
    }
}

/// Advance `run_number` past any run whose base file already exists in
/// `directory` and return the resulting path.
pub fn next_run_file(run_number: &mut u32, prefix: &str, directory: &str) -> PathBuf {
    loop {
        let path = Path::new(directory).join(run_file_name(prefix, *run_number, 0));
        if !path.exists() {
            return path;
        }
        *run_number += 1;
    }
}

/// Append-only run-file writer with bounded size.
pub struct OutputFile {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    size: u64,
    max_size: u64,
    run_number: u32,
    sub_file: u32,
    title: String,
    debug_mode: bool,
    open: bool,
}

impl Default for OutputFile {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFile {
    pub fn new() -> Self {
        Self::with_max_size(MAX_FILE_SIZE)
    }

    /// Writer with a non-standard cap, for exercising rollover in tests.
    pub fn with_max_size(max_size: u64) -> Self {
        Self {
            writer: None,
            path: PathBuf::new(),
            size: 0,
            max_size,
            run_number: 0,
            sub_file: 0,
            title: String::new(),
            debug_mode: false,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    pub fn sub_file(&self) -> u32 {
        self.sub_file
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Toggle synthetic writes. No file I/O happens in debug mode.
    pub fn set_debug_mode(&mut self, debug: bool) {
        self.debug_mode = debug;
    }

    /// Open the next file of a run.
    ///
    /// With `continue_run` the sub-file counter advances and the run number
    /// is kept (rollover); otherwise the counter resets for a fresh run.
    pub fn open_new_file(
        &mut self,
        title: &str,
        run_number: u32,
        prefix: &str,
        directory: &str,
        continue_run: bool,
    ) -> Result<(), OutputError> {
        if self.open {
            return Err(OutputError::AlreadyOpen);
        }

        if continue_run {
            self.sub_file += 1;
        } else {
            self.run_number = run_number;
            self.sub_file = 0;
        }
        self.title = title.to_string();
        self.path =
            Path::new(directory).join(run_file_name(prefix, self.run_number, self.sub_file));
        self.size = 0;

        if !self.debug_mode {
            let file = File::create(&self.path)?;
            let mut writer = BufWriter::with_capacity(64 * 1024, file);
            self.size = write_head_record(&mut writer, self.run_number, &self.title)?;
            self.writer = Some(writer);
        } else {
            self.size = head_record_len(&self.title);
        }

        self.open = true;
        info!(
            path = %self.path.display(),
            run = self.run_number,
            sub_file = self.sub_file,
            "opened output file"
        );
        Ok(())
    }

    /// True when writing `word_count` words plus the EOF provision would
    /// push the file over its cap.
    pub fn would_exceed(&self, word_count: usize) -> bool {
        self.size + 4 * word_count as u64 + EOF_RESERVE > self.max_size
    }

    /// Append spill words. Returns the number of bytes written.
    pub fn write(&mut self, words: &[Word]) -> Result<u64, OutputError> {
        if !self.open {
            return Err(OutputError::NotOpen);
        }
        let bytes = 4 * words.len() as u64;
        if let Some(writer) = self.writer.as_mut() {
            for word in words {
                writer.write_all(&word.to_le_bytes())?;
            }
        }
        self.size += bytes;
        Ok(bytes)
    }

    /// Write the EOF buffers and close. The open flag clears even when the
    /// trailing writes fail.
    pub fn close(&mut self) -> Result<(), OutputError> {
        if !self.open {
            return Err(OutputError::NotOpen);
        }
        self.open = false;
        self.size += EOF_RESERVE;

        if let Some(mut writer) = self.writer.take() {
            write_eof_buffers(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        debug!(path = %self.path.display(), bytes = self.size, "closed output file");
        Ok(())
    }

    /// Send the per-spill notification datagram: file name, size and run
    /// metadata, serialized little-endian.
    pub fn send_packet(&self, client: &BroadcastClient) -> std::io::Result<()> {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut packet = Vec::with_capacity(22 + name.len());
        packet.extend_from_slice(&0x4C49_5053u32.to_le_bytes()); // "SPIL"
        packet.extend_from_slice(&self.run_number.to_le_bytes());
        packet.extend_from_slice(&self.sub_file.to_le_bytes());
        packet.extend_from_slice(&self.size.to_le_bytes());
        packet.extend_from_slice(&(name.len() as u16).to_le_bytes());
        packet.extend_from_slice(name.as_bytes());
        client.send_message(&packet)?;
        Ok(())
    }
}

fn head_record_len(title: &str) -> u64 {
    let padded = title.len().div_ceil(4) * 4;
    (12 + padded) as u64
}

fn write_head_record(
    writer: &mut BufWriter<File>,
    run_number: u32,
    title: &str,
) -> Result<u64, OutputError> {
    writer.write_all(&HEAD_MARKER.to_le_bytes())?;
    writer.write_all(&run_number.to_le_bytes())?;
    writer.write_all(&(title.len() as u32).to_le_bytes())?;
    writer.write_all(title.as_bytes())?;
    let padding = title.len().div_ceil(4) * 4 - title.len();
    writer.write_all(&[0u8; 3][..padding])?;
    Ok(head_record_len(title))
}

fn write_eof_buffers(writer: &mut BufWriter<File>) -> Result<(), OutputError> {
    for _ in 0..2 {
        writer.write_all(&EOF_MARKER.to_le_bytes())?;
        writer.write_all(&((EOF_BUFFER_WORDS - 2) as Word).to_le_bytes())?;
        for _ in 0..EOF_BUFFER_WORDS - 2 {
            writer.write_all(&0xFFFF_FFFFu32.to_le_bytes())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pixie-daq-output-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_names_suffix_sub_files_only() {
        assert_eq!(run_file_name("test", 1, 0), "test_1.ldf");
        assert_eq!(run_file_name("test", 1, 2), "test_1_2.ldf");
    }

    #[test]
    fn next_run_file_advances_past_collisions() {
        let dir = temp_dir();
        let dir_str = dir.to_str().unwrap();
        std::fs::write(dir.join("run_1.ldf"), b"x").unwrap();
        std::fs::write(dir.join("run_2.ldf"), b"x").unwrap();

        let mut run_number = 1;
        let path = next_run_file(&mut run_number, "run", dir_str);
        assert_eq!(run_number, 3);
        assert_eq!(path, dir.join("run_3.ldf"));
    }

    #[test]
    fn open_write_close_produces_file_with_eof_buffers() {
        let dir = temp_dir();
        let dir_str = dir.to_str().unwrap();
        let mut output = OutputFile::new();
        output
            .open_new_file("test title", 7, "test", dir_str, false)
            .unwrap();
        assert!(output.is_open());
        assert_eq!(output.run_number(), 7);

        let written = output.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(written, 16);
        let size_before_close = output.size();
        output.close().unwrap();
        assert!(!output.is_open());

        let on_disk = std::fs::metadata(dir.join("test_7.ldf")).unwrap().len();
        assert_eq!(on_disk, size_before_close + EOF_RESERVE);
        assert_eq!(on_disk, output.size());
    }

    #[test]
    fn rollover_advances_sub_file_and_keeps_run_number() {
        let dir = temp_dir();
        let dir_str = dir.to_str().unwrap();
        let mut output = OutputFile::with_max_size(EOF_RESERVE + 4096);
        output.open_new_file("t", 1, "roll", dir_str, false).unwrap();

        // A spill that fits, then one that would cross the cap.
        assert!(!output.would_exceed(16));
        output.write(&vec![0u32; 16]).unwrap();
        assert!(output.would_exceed(1024));

        output.close().unwrap();
        output.open_new_file("t", 1, "roll", dir_str, true).unwrap();
        assert_eq!(output.run_number(), 1);
        assert_eq!(output.sub_file(), 1);
        assert!(dir.join("roll_1_1.ldf").exists());
    }

    #[test]
    fn write_without_open_file_is_an_error() {
        let mut output = OutputFile::new();
        assert!(matches!(output.write(&[1]), Err(OutputError::NotOpen)));
        assert!(matches!(output.close(), Err(OutputError::NotOpen)));
    }

    #[test]
    fn debug_mode_accounts_without_io() {
        let dir = temp_dir();
        let dir_str = dir.to_str().unwrap();
        let mut output = OutputFile::new();
        output.set_debug_mode(true);
        output.open_new_file("t", 3, "dbg", dir_str, false).unwrap();
        output.write(&[0; 100]).unwrap();
        assert!(output.size() >= 400);
        output.close().unwrap();
        assert!(!dir.join("dbg_3.ldf").exists());
    }

    #[test]
    fn double_open_is_rejected() {
        let dir = temp_dir();
        let dir_str = dir.to_str().unwrap();
        let mut output = OutputFile::new();
        output.open_new_file("t", 1, "dup", dir_str, false).unwrap();
        assert!(matches!(
            output.open_new_file("t", 2, "dup", dir_str, false),
            Err(OutputError::AlreadyOpen)
        ));
    }

    #[test]
    fn size_never_exceeds_cap_after_guarded_writes() {
        let dir = temp_dir();
        let dir_str = dir.to_str().unwrap();
        let cap = EOF_RESERVE + 8192;
        let mut output = OutputFile::with_max_size(cap);
        output.open_new_file("t", 1, "cap", dir_str, false).unwrap();
        let spill = vec![0u32; 256];
        while !output.would_exceed(spill.len()) {
            output.write(&spill).unwrap();
        }
        output.close().unwrap();
        assert!(output.size() <= cap);
    }
}
