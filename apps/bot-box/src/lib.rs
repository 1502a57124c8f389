//! Robot-side session broker for the arena platform.
//!
//! The box keeps one signaling connection to the platform, hosts one peer
//! session per robot unit and relays operator controls to the hardware and
//! hardware telemetry back to the operator.

pub mod app;
pub mod arena;
pub mod auth;
pub mod bot;
pub mod botcom;
pub mod cli;
pub mod communicator;
pub mod config;
pub mod hardware;
pub mod media;
pub mod telemetry;
