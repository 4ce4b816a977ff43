// src/lib.rs - Host-side emulation harness for cooperative firmware
//!
//! Runs embedded firmware code (a [`Sketch`]) on a desktop OS: the
//! [`scheduler`] emulates the device's two-context cooperative scheduler on
//! real threads, and [`net`] maps the device's buffered TCP and UDP
//! primitives onto host sockets.

pub mod config;
pub mod demo;
pub mod net;
pub mod scheduler;

pub use hostmock_shared::{Cooperative, EmuResult, FnSketch, Sketch, Stopped, Token, sketch_fn};
pub use scheduler::{
    Emulator, EmulatorError, RunMode, RunOptions, RunStats, Scheduler, StopCause, run_loop,
};
