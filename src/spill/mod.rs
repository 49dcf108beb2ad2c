//! Spill assembly and event-level validation
//!
//! A spill is one drain of every module's FIFO, framed per module as
//! `[spill_size_including_header, module_index, word_0, …]`. The drainer
//! polls word counts against the threshold, prefixes each module's payload
//! with the fragment carried from the previous spill, and parses the payload
//! event by event to find trailing partial events and corruption.

use crate::common::Word;
use crate::hardware::{HardwareError, Interface};
use crate::stats::StatsHandler;
use thiserror::Error;
use tracing::{debug, warn};

/// Words shown for one event in a corruption dump.
const EVENT_DUMP_LIMIT: usize = 50;

/// Decoded first word of a list-mode event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub channel: u16,
    pub slot: u16,
    /// Event size in 32-bit words, including this header.
    pub length: usize,
    /// Synthetic event, excluded from physics statistics.
    pub virtual_channel: bool,
}

impl EventHeader {
    /// Decode the header fields:
    /// bits [3:0] channel, [7:4] slot, [30:17] event size, [29] virtual.
    pub fn decode(word: Word) -> Self {
        Self {
            channel: (word & 0xF) as u16,
            slot: ((word >> 4) & 0xF) as u16,
            length: ((word & 0x7FFE_0000) >> 17) as usize,
            virtual_channel: word & 0x2000_0000 != 0,
        }
    }
}

/// Why a module payload failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    SlotMismatch { read: u16, expected: u16 },
    InvalidChannel { read: u16 },
    ZeroEventSize,
}

impl std::fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorruptionKind::SlotMismatch { read, expected } => {
                write!(f, "slot read {} does not match expected slot {}", read, expected)
            }
            CorruptionKind::InvalidChannel { read } => {
                write!(f, "channel read ({}) not valid", read)
            }
            CorruptionKind::ZeroEventSize => write!(f, "zero event size"),
        }
    }
}

/// Diagnostic context around a corrupted event: the event before it, the
/// offending event and the event after it, the latter two truncated to
/// [`EVENT_DUMP_LIMIT`] words.
#[derive(Debug, Clone)]
pub struct CorruptionReport {
    pub kind: CorruptionKind,
    /// Words successfully parsed before the offending event.
    pub parsed_words: usize,
    /// Total words in the module payload.
    pub total_words: usize,
    pub previous: Vec<Word>,
    pub offending: Vec<Word>,
    /// Declared length of the offending event.
    pub offending_len: usize,
    pub following: Vec<Word>,
    /// Declared length of the following event.
    pub following_len: usize,
}

fn dump_words(f: &mut std::fmt::Formatter<'_>, words: &[Word]) -> std::fmt::Result {
    for (index, word) in words.iter().enumerate() {
        if index % 5 == 0 {
            write!(f, "\n|  ")?;
        }
        write!(f, "0x{:08x} ", word)?;
    }
    writeln!(f)
}

impl std::fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        writeln!(
            f,
            "| Parsing failed at {}/{} words into FIFO.",
            self.parsed_words, self.total_words
        )?;
        write!(
            f,
            "|\n| Event prior to parsing error ({} words):",
            self.previous.len()
        )?;
        dump_words(f, &self.previous)?;
        write!(
            f,
            "|\n| Event at parsing error ({} words):",
            self.offending_len
        )?;
        if self.offending.len() < self.offending_len {
            write!(f, "\n| (Truncated at {} words.)", self.offending.len())?;
        }
        dump_words(f, &self.offending)?;
        write!(
            f,
            "|\n| Event after parsing error ({} words):",
            self.following_len
        )?;
        if self.following.len() < self.following_len {
            write!(f, "\n| (Truncated at {} words.)", self.following.len())?;
        }
        dump_words(f, &self.following)?;
        writeln!(f, "|")
    }
}

/// Result of walking one module payload.
#[derive(Debug)]
pub enum ParseOutcome {
    /// The payload holds whole events only.
    Clean,
    /// The trailing event is incomplete; its available words form the
    /// fragment to carry into the next spill.
    Partial { fragment_words: usize },
    /// Validation failed mid-payload.
    Corrupt(Box<CorruptionReport>),
}

/// Walk a module payload event by event.
///
/// `on_event` is invoked for every event fully contained in the payload; a
/// trailing event whose declared size runs past the end is reported through
/// [`ParseOutcome::Partial`] instead, and is counted when it completes in the
/// next spill.
pub fn parse_module_payload(
    payload: &[Word],
    slot_expected: u16,
    mut on_event: impl FnMut(&EventHeader),
) -> ParseOutcome {
    let total = payload.len();
    let mut cursor = 0usize;
    let mut prev_len = 0usize;

    while cursor < total {
        let header = EventHeader::decode(payload[cursor]);

        let kind = if header.slot != slot_expected {
            Some(CorruptionKind::SlotMismatch {
                read: header.slot,
                expected: slot_expected,
            })
        } else if header.channel > 15 {
            Some(CorruptionKind::InvalidChannel {
                read: header.channel,
            })
        } else if header.length == 0 {
            Some(CorruptionKind::ZeroEventSize)
        } else {
            None
        };

        if let Some(kind) = kind {
            return ParseOutcome::Corrupt(Box::new(build_report(
                payload, cursor, prev_len, header.length, kind,
            )));
        }

        if cursor + header.length > total {
            // Trailing event only partly read from the FIFO.
            return ParseOutcome::Partial {
                fragment_words: total - cursor,
            };
        }

        on_event(&header);
        cursor += header.length;
        prev_len = header.length;
    }

    ParseOutcome::Clean
}

fn build_report(
    payload: &[Word],
    cursor: usize,
    prev_len: usize,
    event_len: usize,
    kind: CorruptionKind,
) -> CorruptionReport {
    let total = payload.len();
    let previous = payload[cursor - prev_len.min(cursor)..cursor].to_vec();

    let offending_end = (cursor + event_len.min(EVENT_DUMP_LIMIT)).min(total);
    let offending = payload[cursor..offending_end].to_vec();

    let following_start = (cursor + event_len).min(total);
    let following_len = if following_start < total {
        EventHeader::decode(payload[following_start]).length
    } else {
        0
    };
    let following_end = (following_start + following_len.min(EVENT_DUMP_LIMIT)).min(total);
    let following = payload[following_start..following_end].to_vec();

    CorruptionReport {
        kind,
        parsed_words: cursor,
        total_words: total,
        previous,
        offending,
        offending_len: event_len,
        following,
        following_len,
    }
}

/// Drain failures that abort the current cycle and latch the error flag.
#[derive(Error, Debug)]
pub enum DrainError {
    #[error("full FIFO in module {module}: {words}/{capacity} words")]
    FifoOverflow {
        module: u16,
        words: usize,
        capacity: usize,
    },

    #[error("unable to read {words} words from module {module}: {source}")]
    ReadFailed {
        module: u16,
        words: usize,
        source: HardwareError,
    },

    #[error("corrupted data in module {module}: {report}")]
    Corrupt {
        module: u16,
        report: Box<CorruptionReport>,
    },

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Assembles spills out of the per-module FIFOs.
///
/// Owns the spill buffer and the per-module partial-event stores. For each
/// module the concatenation of successive spills equals the hardware stream
/// exactly: a fragment is cleared exactly when it is prefixed into the next
/// drain of that module, or reported at run end.
pub struct SpillDrainer {
    slot_map: Vec<u16>,
    fifo_capacity: usize,
    min_read: usize,
    poll_tries: u32,
    partials: Vec<Vec<Word>>,
    buffer: Vec<Word>,
}

impl SpillDrainer {
    pub fn new(slot_map: Vec<u16>, fifo_capacity: usize, min_read: usize, poll_tries: u32) -> Self {
        let n = slot_map.len();
        Self {
            slot_map,
            fifo_capacity,
            min_read,
            poll_tries,
            partials: vec![Vec::new(); n],
            buffer: Vec::with_capacity((fifo_capacity + 2) * n),
        }
    }

    pub fn num_modules(&self) -> u16 {
        self.slot_map.len() as u16
    }

    /// Words currently carried for a module.
    pub fn partial_words(&self, module: u16) -> usize {
        self.partials[module as usize].len()
    }

    /// Drop a module's fragment (run-end reporting); returns its size.
    pub fn clear_partial(&mut self, module: u16) -> usize {
        let n = self.partials[module as usize].len();
        self.partials[module as usize].clear();
        n
    }

    /// Perform one drain cycle.
    ///
    /// Polls the FIFO word counts up to `poll_tries` times. If any module
    /// then exceeds `thresh_words`, or `force` is set, reads every module
    /// into the spill buffer, parses, and returns the assembled spill.
    /// `Ok(None)` means the threshold was not met.
    pub fn drain(
        &mut self,
        pif: &mut dyn Interface,
        thresh_words: usize,
        force: bool,
        stats: &mut StatsHandler,
    ) -> Result<Option<&[Word]>, DrainError> {
        let n = self.slot_map.len();
        let mut nwords = vec![0usize; n];

        // Tight poll by design: the vendor API amortizes repeated count
        // queries, and sleeping here costs spill latency.
        for _ in 0..self.poll_tries {
            for (module, count) in nwords.iter_mut().enumerate() {
                *count = pif.check_fifo_words(module as u16)?;
            }
            if nwords.iter().copied().max().unwrap_or(0) > thresh_words {
                break;
            }
        }

        let max = nwords.iter().copied().max().unwrap_or(0);
        if max <= thresh_words && !force {
            return Ok(None);
        }

        self.buffer.clear();

        for module_index in 0..n {
            let module = module_index as u16;
            let count = nwords[module_index];

            if count < self.min_read {
                // Empty-module record.
                self.buffer.push(2);
                self.buffer.push(module as Word);
                continue;
            }

            if count >= self.fifo_capacity {
                warn!(module, words = count, "full FIFO, aborting drain");
                return Err(DrainError::FifoOverflow {
                    module,
                    words: count,
                    capacity: self.fifo_capacity,
                });
            }

            let header_pos = self.buffer.len();
            self.buffer.push(0); // spill size, backfilled below
            self.buffer.push(module as Word);

            let partial_len = self.partials[module_index].len();
            self.buffer.extend_from_slice(&self.partials[module_index]);

            let read_start = self.buffer.len();
            self.buffer.resize(read_start + count, 0);
            if let Err(source) = pif.read_fifo_words(&mut self.buffer[read_start..], module) {
                return Err(DrainError::ReadFailed {
                    module,
                    words: count,
                    source,
                });
            }

            debug!(
                module,
                words = count,
                carried = partial_len,
                position = read_start,
                "read FIFO"
            );

            let mut payload_len = count + partial_len;
            self.partials[module_index].clear();

            let payload_start = header_pos + 2;
            let outcome = parse_module_payload(
                &self.buffer[payload_start..payload_start + payload_len],
                self.slot_map[module_index],
                |header| {
                    if !header.virtual_channel {
                        stats.add_event(module, header.channel, 4 * header.length as u64);
                    }
                },
            );

            match outcome {
                ParseOutcome::Clean => {}
                ParseOutcome::Partial { fragment_words } => {
                    debug!(module, fragment_words, "carrying partial event");
                    let fragment_start = payload_start + payload_len - fragment_words;
                    let end = payload_start + payload_len;
                    self.partials[module_index]
                        .extend_from_slice(&self.buffer[fragment_start..end]);
                    payload_len -= fragment_words;
                    self.buffer.truncate(payload_start + payload_len);
                }
                ParseOutcome::Corrupt(report) => {
                    return Err(DrainError::Corrupt { module, report });
                }
            }

            self.buffer[header_pos] = (payload_len + 2) as Word;
        }

        Ok(Some(&self.buffer))
    }
}
