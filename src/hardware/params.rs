//! DSP parameter name tables and CHANNEL_CSRA bit definitions
//!
//! The name lists mirror the DSP variable sets of the Pixie-16 firmware and
//! are used for argument validation and the `pread`/`pwrite` help dialogs.

/// Channel-level DSP parameters (floating point).
pub const CHANNEL_PARAMS: &[&str] = &[
    "TRIGGER_RISETIME",
    "TRIGGER_FLATTOP",
    "TRIGGER_THRESHOLD",
    "ENERGY_RISETIME",
    "ENERGY_FLATTOP",
    "TAU",
    "TRACE_LENGTH",
    "TRACE_DELAY",
    "VOFFSET",
    "XDT",
    "BASELINE_PERCENT",
    "EMIN",
    "BINFACTOR",
    "CHANNEL_CSRA",
    "CHANNEL_CSRB",
    "BLCUT",
    "ExternDelayLen",
    "ExtTrigStretch",
    "ChanTrigStretch",
    "FtrigoutDelay",
    "FASTTRIGBACKLEN",
    "CFDDelay",
    "CFDScale",
    "CFDThresh",
    "QDCLen0",
    "QDCLen1",
    "QDCLen2",
    "QDCLen3",
    "QDCLen4",
    "QDCLen5",
    "QDCLen6",
    "QDCLen7",
    "VetoStretch",
    "MultiplicityMaskL",
    "MultiplicityMaskH",
];

/// Module-level DSP parameters (32-bit words).
pub const MODULE_PARAMS: &[&str] = &[
    "MODULE_CSRA",
    "MODULE_CSRB",
    "MODULE_FORMAT",
    "MAX_EVENTS",
    "SYNCH_WAIT",
    "IN_SYNCH",
    "SLOW_FILTER_RANGE",
    "FAST_FILTER_RANGE",
    "ModuleID",
    "TrigConfig0",
    "TrigConfig1",
    "TrigConfig2",
    "TrigConfig3",
    "FastTrigBackplaneEna",
    "CrateID",
    "SlotID",
    "HOST_RT_PRESET",
];

/// Named CHANNEL_CSRA bits, indexed by bit position.
pub const CSRA_BITS: &[(u8, &str)] = &[
    (0, "external fast trigger selection"),
    (1, "module validation trigger selection"),
    (2, "good channel"),
    (3, "channel validation trigger selection"),
    (4, "block data acquisition if trace buffers full"),
    (5, "trigger on positive slope"),
    (6, "veto enable"),
    (7, "histogram energies"),
    (8, "trace capture"),
    (9, "QDC sums"),
    (10, "CFD trigger mode"),
    (11, "require module validation"),
    (12, "capture raw energy sums and baselines"),
    (13, "require channel validation"),
    (14, "enable input attenuation (gain relay)"),
    (15, "pileup rejection"),
    (16, "inverse pileup rejection"),
    (17, "disable out-of-range corrections"),
    (18, "record summed single events"),
];

/// True when `name` is a known channel parameter.
pub fn is_channel_param(name: &str) -> bool {
    CHANNEL_PARAMS.contains(&name)
}

/// True when `name` is a known module parameter.
pub fn is_module_param(name: &str) -> bool {
    MODULE_PARAMS.contains(&name)
}

/// Name for a CHANNEL_CSRA bit, if it is defined.
pub fn csra_bit_name(bit: u8) -> Option<&'static str> {
    CSRA_BITS
        .iter()
        .find(|(index, _)| *index == bit)
        .map(|(_, name)| *name)
}

/// Decode a CHANNEL_CSRA value into per-bit set/unset lines.
pub fn decode_csra(value: u32) -> Vec<(u8, &'static str, bool)> {
    CSRA_BITS
        .iter()
        .map(|&(bit, name)| (bit, name, value & (1 << bit) != 0))
        .collect()
}

/// Positions of the set bits in `value`, considering the low `num_bits`.
pub fn active_bits(num_bits: u8, value: u32) -> Vec<u8> {
    (0..num_bits.min(32))
        .filter(|bit| value & (1u32 << bit) != 0)
        .collect()
}
