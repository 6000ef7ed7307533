//! The Percolator Library
//!
//! This crate contains all the moving parts of Percolator. The application
//! itself, via `main.rs`, is only a very tiny frontend.
//!
//! Percolator is a pre-fork web server: a master process owns the listening
//! socket and hands accepted connections to a fixed pool of worker
//! processes over per-worker control channels. Each worker parses the
//! request and runs the named handler, either as a subprocess with a
//! CGI-style environment or as a sandboxed WebAssembly module.

pub use self::config::Config;
pub use self::error::{ExitError, Failed};
pub use self::operation::Operation;

pub mod cgi;
pub mod config;
pub mod deploy;
pub mod error;
pub mod fdpass;
pub mod instances;
pub mod log;
pub mod master;
pub mod operation;
pub mod process;
pub mod request;
pub mod response;
pub mod wasm;
pub mod worker;
