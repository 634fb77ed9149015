//! Child process spawning utilities.
//!
//! This module provides an async-first approach to spawning and supervising
//! child processes with line-streamed output.

mod spawn;

pub use spawn::{
    spawn_process, spawn_supervised, ProcessControl, ProcessInput, ProcessOptions, ProcessOutput,
    ProcessResult, SupervisedProcess,
};
