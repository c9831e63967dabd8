//! voxrelay: a voice-agent relay and its reference client.
//!
//! The relay pairs each browser connection with its own agent connection and
//! injects the caller's identity before any payload. The client side captures
//! audio, streams it over an [`net_link::AgentLink`] and plays replies back in
//! order.

pub mod audio;
pub mod config;
pub mod contribution;
pub mod controller;
pub mod identity;
pub mod net_link;
pub mod protocol;
pub mod records;
pub mod relay;
pub mod storage;
