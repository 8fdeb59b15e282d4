//! Capture/playback session state machine
//!
//! This module provides the `SessionMachine` that coordinates:
//! - Exclusive access to the audio device
//! - Capture into uniquely named recordings
//! - Playback of stored recordings, ended explicitly or by end-of-stream
//! - State-change events for the caller

mod config;
mod machine;
mod state;

pub use config::SessionConfig;
pub use machine::SessionMachine;
pub use state::SessionPhase;
