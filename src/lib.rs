//! Demo chaining library.
//!
//! This crate provides the core types and logic used by the `demo_chain`
//! binary and the `demo_inspect` tool:
//!
//! - `demo`: walker for the Source engine demo message stream, finding the
//!   last tick recorded in a demo
//! - `vdm`: playback script writer that makes a demo jump to the next one
//!   (or exit) near its end, playing back at an accelerated rate
//! - `session`: chains every demo of a recorded session folder, in
//!   recording order
//!
//! Scanning and writing are synchronous and touch one file per call, so
//! callers may process independent demos in parallel.
pub mod demo;
pub mod session;
pub mod vdm;
