//! CLI layer: engine bootstrap and command implementations

pub mod commands;
