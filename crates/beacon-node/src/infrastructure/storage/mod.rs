//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration file, fills in
//! defaults for anything missing, validates the timing constraints, and
//! converts the result into the settings types `beacon_core` consumes.

pub mod config;
