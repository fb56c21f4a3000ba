//! on_air: broadcast timeline for a call-in radio show.
//!
//! Units of on-air content run one at a time; the break scheduler cuts in
//! at fixed points and the ad breaks pay out by audience size.
//! The CLI in `main.rs` drives this crate headless or against a sound card.

pub mod asset;
pub mod audio;
pub mod audio_runtime;
pub mod break_scheduler;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod schedule;
pub mod stage;
pub mod station;
pub mod timeline;
pub mod unit;
pub mod wait;
