//! Data models for the bridge
//!
//! This module contains the media descriptions that flow between the engine,
//! the relay and the sessions, and the signaling messages on the wire.

pub mod media;
pub mod message;
