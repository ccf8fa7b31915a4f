//! CLI Commands

pub mod band;
pub mod devices;
pub mod settings;
pub mod status;
pub mod tunnel;
