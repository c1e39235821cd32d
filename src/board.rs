//! Collaborators the device core drives or is driven by.
//!
//! Each trait documents which context calls into it. Implementations live in
//! the host bindings (`gui_bridge`, `iot_bridge`, `audio_bridge`) or in tests.

use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::{WakeReasons, WakeSignal};
use crate::state_machine::DeviceState;

/// Raised by the audio hardware when capture data or playback space is
/// available. Safe from interrupt context: no lock, no allocation.
#[derive(Clone)]
pub struct AudioReadySignal {
    signal: WakeSignal,
}

impl AudioReadySignal {
    pub fn new(signal: WakeSignal) -> Self {
        Self { signal }
    }

    pub fn input_ready(&self) {
        self.signal.raise(WakeReasons::AUDIO_INPUT_READY);
    }

    pub fn output_ready(&self) {
        self.signal.raise(WakeReasons::AUDIO_OUTPUT_READY);
    }
}

/// PCM16 audio hardware. `read`/`write` never block.
pub trait AudioCodec: Send {
    fn input_sample_rate(&self) -> u32;
    fn output_sample_rate(&self) -> u32;
    fn input_channels(&self) -> usize;
    /// Capture carries an acoustic-reference channel next to the mic.
    fn has_reference(&self) -> bool;

    /// Fill `buffer` with whatever capture data is available. Returns false
    /// when nothing was read.
    fn read(&mut self, buffer: &mut Vec<i16>) -> bool;
    fn write(&mut self, samples: &[i16]);

    fn enable_input(&mut self, enable: bool);
    fn enable_output(&mut self, enable: bool);
    fn output_enabled(&self) -> bool;

    /// Begin raising `ready` notifications.
    fn start(&mut self, ready: AudioReadySignal);
}

/// Screen. Fire-and-forget, internally synchronized.
pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);
    fn set_chat_message(&self, role: &str, content: &str);
    fn set_emotion(&self, emotion: &str);
    fn show_notification(&self, text: &str, duration: Duration);
}

/// Status LED. Called on the dispatcher thread after every transition.
pub trait Led: Send + Sync {
    fn on_state_changed(&self, state: DeviceState, voice_detected: bool);
}

/// Receives wake-word detector events. Called from the detector's own thread.
pub trait WakeWordListener: Send + Sync {
    fn on_vad_state_change(&self, speaking: bool);
    fn on_wake_word_detected(&self, wake_word: String);
}

pub trait WakeWordDetector: Send {
    fn initialize(&mut self, channels: usize, reference: bool, listener: Arc<dyn WakeWordListener>);
    fn feed(&mut self, pcm: &[i16]);
    fn start_detection(&mut self);
    fn stop_detection(&mut self);
    fn is_detection_running(&self) -> bool;
    /// Encode the audio that triggered detection. May block; runs before
    /// the channel opens.
    fn encode_wake_word_data(&mut self);
    /// Drain the encoded wake-word audio, one Opus packet at a time.
    fn take_wake_word_opus(&mut self) -> Option<Vec<u8>>;
}

/// Receives processed capture audio. Called from the processor's thread.
pub trait AudioProcessorSink: Send + Sync {
    fn on_output(&self, pcm: Vec<i16>);
}

/// Echo cancellation / VAD front end.
pub trait AudioProcessor: Send {
    fn initialize(&mut self, channels: usize, reference: bool, sink: Arc<dyn AudioProcessorSink>);
    fn input(&mut self, pcm: &[i16]);
    fn start(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// IoT thing registry.
pub trait IotDispatcher: Send + Sync {
    fn descriptors_json(&self) -> String;
    fn states_json(&self) -> String;
    fn invoke(&self, command: &serde_json::Value);
}

/// Platform services: power management, reboot, wall clock.
pub trait Platform: Send + Sync {
    fn set_power_save_mode(&self, enabled: bool);
    fn reboot(&self);
    /// Set the wall clock. `utc_ms` is plain epoch time; the local zone is
    /// `offset_minutes` east of UTC.
    fn set_system_time_ms(&self, utc_ms: i64, offset_minutes: i64);
}

/// Namespaced persistent key-value settings.
pub trait SettingsStore: Send + Sync {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String>;
    fn set_string(&self, namespace: &str, key: &str, value: &str);
}

/// Everything the application core needs from the board, injected at
/// construction.
pub struct Board {
    pub codec: Box<dyn AudioCodec>,
    pub display: Arc<dyn Display>,
    pub led: Arc<dyn Led>,
    pub iot: Arc<dyn IotDispatcher>,
    pub platform: Arc<dyn Platform>,
    pub wake_word: Option<Box<dyn WakeWordDetector>>,
    pub audio_processor: Option<Box<dyn AudioProcessor>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventDispatcher;

    #[test]
    fn ready_signal_raises_matching_reasons() {
        let dispatcher = EventDispatcher::<()>::new();
        let ready = AudioReadySignal::new(dispatcher.wake_signal());
        ready.input_ready();
        ready.input_ready();
        let pending = dispatcher.take_pending();
        assert!(pending.contains(WakeReasons::AUDIO_INPUT_READY));
        assert!(!pending.contains(WakeReasons::AUDIO_OUTPUT_READY));

        ready.output_ready();
        assert!(dispatcher.take_pending().contains(WakeReasons::AUDIO_OUTPUT_READY));
    }
}
