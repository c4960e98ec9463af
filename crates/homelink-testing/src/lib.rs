//! Testing utilities for HomeLink
//!
//! This crate provides:
//! - [`RecordingBus`], an in-process message bus that records outbound traffic

pub mod bus;

pub use bus::{Published, RecordingBus};
