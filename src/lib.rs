//! Control core of a voice-interactive device.
//!
//! The [`application::Application`] state machine runs on a cooperative
//! dispatcher thread and drives the audio codec pipeline, the websocket
//! session protocol and the OTA updater. Hardware and host services are
//! reached through the traits in [`board`].

pub mod application;
pub mod audio;
pub mod audio_bridge;
pub mod background;
pub mod board;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gui_bridge;
pub mod iot_bridge;
pub mod net_link;
pub mod ota;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod state_machine;

#[cfg(test)]
pub(crate) mod testing;
