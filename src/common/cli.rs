//! CLI argument parsing for the daq binary

use clap::Parser;

/// Arguments for the crate run controller.
#[derive(Parser, Debug, Clone)]
#[command(name = "daq", about = "Pixie-16 crate run controller")]
pub struct DaqArgs {
    /// Path to the crate configuration TOML file
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<String>,

    /// Start with per-spill console output suppressed
    #[arg(long)]
    pub quiet: bool,

    /// Start with debug diagnostics and synthetic file writes
    #[arg(long)]
    pub debug: bool,

    /// Boot without reprogramming every FPGA
    #[arg(long = "fast-boot")]
    pub fast_boot: bool,

    /// Override the output directory
    #[arg(long = "fdir")]
    pub output_dir: Option<String>,

    /// Override the run-file prefix
    #[arg(long)]
    pub prefix: Option<String>,

    /// FIFO polling threshold as a percentage of FIFO capacity
    #[arg(long)]
    pub thresh: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = DaqArgs::try_parse_from(["daq"]).unwrap();
        assert_eq!(args.config_file, None);
        assert!(!args.quiet);
        assert!(!args.debug);
        assert!(!args.fast_boot);
        assert_eq!(args.thresh, None);
    }

    #[test]
    fn config_short_and_long() {
        let args = DaqArgs::try_parse_from(["daq", "-f", "crate.toml"]).unwrap();
        assert_eq!(args.config_file.as_deref(), Some("crate.toml"));
        let args = DaqArgs::try_parse_from(["daq", "--config", "other.toml"]).unwrap();
        assert_eq!(args.config_file.as_deref(), Some("other.toml"));
    }

    #[test]
    fn overrides() {
        let args = DaqArgs::try_parse_from([
            "daq",
            "--fdir",
            "/data",
            "--prefix",
            "test",
            "--thresh",
            "25",
            "--fast-boot",
        ])
        .unwrap();
        assert_eq!(args.output_dir.as_deref(), Some("/data"));
        assert_eq!(args.prefix.as_deref(), Some("test"));
        assert_eq!(args.thresh, Some(25.0));
        assert!(args.fast_boot);
    }
}
