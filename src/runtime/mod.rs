//! The runtime: runloops, extension threads, engines, and path tracking.

pub mod engine;
pub mod extension;
pub mod path_table;
pub mod runloop;
pub mod thread;
