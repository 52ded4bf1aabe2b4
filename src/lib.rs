//! Stashpoint - device-flow login for command-line clients
//!
//! This library provides the server, storage and CLI client for the
//! stashpoint device authorization handshake.
//! It exposes all modules for testing purposes.

pub mod client;
pub mod clock;
pub mod device_flow;
pub mod entities;
pub mod errors;
pub mod session;
pub mod settings;
pub mod storage;
pub mod web;
