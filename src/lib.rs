//! pixie-daq: run controller for XIA Pixie-16 style crates
//!
//! This crate drives a multi-module digital pulse-processing crate: it drains
//! the per-module hardware FIFOs into spill buffers, validates the event
//! stream, records spills to rolling run files, broadcasts them over UDP and
//! supports an MCA histogramming mode next to list-mode streaming.

pub mod broadcast;
pub mod common;
pub mod config;
pub mod controller;
pub mod hardware;
pub mod mca;
pub mod output;
pub mod spill;
pub mod stats;
