// Public API - session orchestration, metrics, and result types
pub mod config;
pub mod echo;
pub mod export;
pub mod probe;
pub mod session;
pub mod state;

// CLI argument parsing, shared with the binary entry point
pub mod cli;
