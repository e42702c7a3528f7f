// Library re-exports for integration testing.
// The main binary is in main.rs; this exposes selected modules for tests.

pub mod cli;
pub mod config;
pub mod error;
pub mod relay;

pub mod commands;
