//! Zero-code runtime call tracing for dynamic-language programs.
//!
//! The engine hooks a runtime's per-frame trace facility, derives a
//! structured event stream (call tree, timings, thread context, protocol
//! classification), persists the session on shutdown and broadcasts every
//! event to local subscribers as line-delimited JSON over a loopback TCP
//! socket.
//!
//! The presence of the tracer never changes the host program's observable
//! behavior except by timing: callback failures are swallowed and counted,
//! slow subscribers never back-pressure the traced program, and budget
//! exhaustion degrades into a clean shutdown.

#![doc(issue_tracker_base_url = "https://github.com/hertz-ai/flowtrace/issues/")]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]

/// Environment-gated process activation.
pub mod bootstrap;

/// The instrumentor engine, event model and stream server.
pub mod tracing;
