//! # mutant-playground
//!
//! `mutant-playground` runs a single mutation test session over one program
//! and its test suite:
//! - `session::compile`: the compiler seam and a command-backed compiler
//! - `session::sandbox`: per-run isolation with hard timeouts
//! - `session::orchestrator`: the session state machine and worker pool
//! - `session::score` / `session::report`: mutation score and report tree
//!
//! Mutant generation is the compiler's job. This crate drives it, runs the
//! tests once per mutant and classifies each one.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod prelude;
pub mod session;
