//! Device-wide state enums and the shared read-only view of the current state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Operating state of the device. The numeric codes are what the GUI
/// process receives as `{"state": <code>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    Unknown = 0,
    Starting = 1,
    Configuring = 2,
    Idle = 3,
    Connecting = 4,
    Listening = 5,
    Speaking = 6,
    Upgrading = 7,
    Activating = 8,
    FatalError = 9,
}

impl DeviceState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Starting,
            2 => Self::Configuring,
            3 => Self::Idle,
            4 => Self::Connecting,
            5 => Self::Listening,
            6 => Self::Speaking,
            7 => Self::Upgrading,
            8 => Self::Activating,
            9 => Self::FatalError,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Configuring => "configuring",
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Upgrading => "upgrading",
            Self::Activating => "activating",
            Self::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why the device asked the server to stop speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

/// How a listening turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningMode {
    /// Server VAD ends the turn.
    AutoStop,
    /// The user ends the turn (push-to-talk).
    ManualStop,
    /// Full duplex, requires echo cancellation.
    Realtime,
}

impl ListeningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoStop => "auto",
            Self::ManualStop => "manual",
            Self::Realtime => "realtime",
        }
    }
}

/// Eventually-consistent mirror of the device state.
///
/// Only the dispatcher thread writes it (through `Application::set_device_state`);
/// everyone else may read a slightly stale value.
#[derive(Debug, Clone)]
pub struct SharedDeviceState(Arc<AtomicU8>);

impl SharedDeviceState {
    pub fn new(state: DeviceState) -> Self {
        Self(Arc::new(AtomicU8::new(state.code())))
    }

    pub fn get(&self) -> DeviceState {
        DeviceState::from_code(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: DeviceState) {
        self.0.store(state.code(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_mirror() {
        let shared = SharedDeviceState::new(DeviceState::Unknown);
        for code in 0..=9u8 {
            let state = DeviceState::from_code(code);
            shared.set(state);
            assert_eq!(shared.get().code(), code);
        }
    }

    #[test]
    fn gui_codes_match_wire_values() {
        assert_eq!(DeviceState::Idle.code(), 3);
        assert_eq!(DeviceState::Connecting.code(), 4);
        assert_eq!(DeviceState::Listening.code(), 5);
        assert_eq!(DeviceState::Speaking.code(), 6);
        assert_eq!(DeviceState::from_code(42), DeviceState::Unknown);
    }

    #[test]
    fn listening_mode_wire_names() {
        assert_eq!(ListeningMode::AutoStop.as_str(), "auto");
        assert_eq!(ListeningMode::ManualStop.as_str(), "manual");
        assert_eq!(ListeningMode::Realtime.as_str(), "realtime");
    }
}
