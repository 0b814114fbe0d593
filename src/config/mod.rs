//! Configuration
//!
//! Shared types, probe tables (built-in presets or JSON), and validation.

pub mod loader;
pub mod presets;
pub mod types;
pub mod validator;

pub use loader::{ProbeConfig, DEFAULT_CONFIG_FILE};
