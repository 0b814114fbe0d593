//! Thin wrappers around Linux and x86 primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> process -> trace, cpu and input are leaves.

pub mod cpu;
pub mod input;
pub mod process;
pub mod signal;
pub mod trace;
