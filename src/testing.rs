//! In-memory board used by the application and version-checker tests.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::board::{
    AudioCodec, AudioReadySignal, Board, Display, IotDispatcher, Led, WakeWordDetector,
    WakeWordListener,
};
use crate::ota::testing::FakePlatform;
use crate::state_machine::DeviceState;

#[derive(Default)]
pub struct CodecTap {
    pub written: Mutex<Vec<Vec<i16>>>,
    pub capture: Mutex<VecDeque<Vec<i16>>>,
    pub input_enabled: AtomicBool,
    pub output_enabled: AtomicBool,
    pub output_toggles: Mutex<Vec<bool>>,
    pub ready: Mutex<Option<AudioReadySignal>>,
}

impl CodecTap {
    pub fn written_samples(&self) -> usize {
        self.written.lock().unwrap().iter().map(Vec::len).sum()
    }
}

pub struct FakeCodec {
    tap: Arc<CodecTap>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
}

impl AudioCodec for FakeCodec {
    fn input_sample_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn has_reference(&self) -> bool {
        self.channels == 2
    }

    fn read(&mut self, buffer: &mut Vec<i16>) -> bool {
        match self.tap.capture.lock().unwrap().pop_front() {
            Some(data) => {
                *buffer = data;
                true
            }
            None => false,
        }
    }

    fn write(&mut self, samples: &[i16]) {
        self.tap.written.lock().unwrap().push(samples.to_vec());
    }

    fn enable_input(&mut self, enable: bool) {
        self.tap.input_enabled.store(enable, Ordering::SeqCst);
    }

    fn enable_output(&mut self, enable: bool) {
        self.tap.output_enabled.store(enable, Ordering::SeqCst);
        self.tap.output_toggles.lock().unwrap().push(enable);
    }

    fn output_enabled(&self) -> bool {
        self.tap.output_enabled.load(Ordering::SeqCst)
    }

    fn start(&mut self, ready: AudioReadySignal) {
        self.enable_input(true);
        *self.tap.ready.lock().unwrap() = Some(ready);
    }
}

#[derive(Default)]
pub struct RecordingDisplay {
    pub status: Mutex<Vec<String>>,
    pub chat: Mutex<Vec<(String, String)>>,
    pub emotions: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<String>>,
}

impl RecordingDisplay {
    pub fn last_status(&self) -> Option<String> {
        self.status.lock().unwrap().last().cloned()
    }

    pub fn last_chat(&self) -> Option<(String, String)> {
        self.chat.lock().unwrap().last().cloned()
    }
}

impl Display for RecordingDisplay {
    fn set_status(&self, status: &str) {
        self.status.lock().unwrap().push(status.to_string());
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        self.chat
            .lock()
            .unwrap()
            .push((role.to_string(), content.to_string()));
    }

    fn set_emotion(&self, emotion: &str) {
        self.emotions.lock().unwrap().push(emotion.to_string());
    }

    fn show_notification(&self, text: &str, _duration: Duration) {
        self.notifications.lock().unwrap().push(text.to_string());
    }
}

#[derive(Default)]
pub struct RecordingLed {
    pub changes: Mutex<Vec<(DeviceState, bool)>>,
}

impl Led for RecordingLed {
    fn on_state_changed(&self, state: DeviceState, voice_detected: bool) {
        self.changes.lock().unwrap().push((state, voice_detected));
    }
}

pub struct FakeIot {
    pub descriptors: String,
    pub states: Mutex<String>,
    pub invoked: Mutex<Vec<Value>>,
}

impl Default for FakeIot {
    fn default() -> Self {
        Self {
            descriptors: r#"[{"name":"Speaker"}]"#.to_string(),
            states: Mutex::new(r#"[{"name":"Speaker","state":{"volume":50}}]"#.to_string()),
            invoked: Mutex::new(Vec::new()),
        }
    }
}

impl IotDispatcher for FakeIot {
    fn descriptors_json(&self) -> String {
        self.descriptors.clone()
    }

    fn states_json(&self) -> String {
        self.states.lock().unwrap().clone()
    }

    fn invoke(&self, command: &Value) {
        self.invoked.lock().unwrap().push(command.clone());
    }
}

#[derive(Default)]
pub struct WakeTap {
    pub running: AtomicBool,
    pub starts: AtomicUsize,
    pub fed: AtomicUsize,
    pub encoded: AtomicBool,
    pub packets: Mutex<Vec<Vec<u8>>>,
    pub listener: Mutex<Option<Arc<dyn WakeWordListener>>>,
}

impl WakeTap {
    pub fn listener(&self) -> Arc<dyn WakeWordListener> {
        self.listener.lock().unwrap().clone().unwrap()
    }
}

pub struct FakeWakeWord {
    tap: Arc<WakeTap>,
}

impl WakeWordDetector for FakeWakeWord {
    fn initialize(&mut self, _channels: usize, _reference: bool, listener: Arc<dyn WakeWordListener>) {
        *self.tap.listener.lock().unwrap() = Some(listener);
    }

    fn feed(&mut self, pcm: &[i16]) {
        self.tap.fed.fetch_add(pcm.len(), Ordering::SeqCst);
    }

    fn start_detection(&mut self) {
        self.tap.starts.fetch_add(1, Ordering::SeqCst);
        self.tap.running.store(true, Ordering::SeqCst);
    }

    fn stop_detection(&mut self) {
        self.tap.running.store(false, Ordering::SeqCst);
    }

    fn is_detection_running(&self) -> bool {
        self.tap.running.load(Ordering::SeqCst)
    }

    fn encode_wake_word_data(&mut self) {
        self.tap.encoded.store(true, Ordering::SeqCst);
    }

    fn take_wake_word_opus(&mut self) -> Option<Vec<u8>> {
        let mut packets = self.tap.packets.lock().unwrap();
        if packets.is_empty() {
            None
        } else {
            Some(packets.remove(0))
        }
    }
}

/// Handles to every fake inside a [`Board`] built by [`board`].
pub struct Rig {
    pub codec: Arc<CodecTap>,
    pub display: Arc<RecordingDisplay>,
    pub led: Arc<RecordingLed>,
    pub iot: Arc<FakeIot>,
    pub platform: Arc<FakePlatform>,
    pub wake: Arc<WakeTap>,
}

pub fn board(input_rate: u32, output_rate: u32, with_wake_word: bool) -> (Board, Rig) {
    let rig = Rig {
        codec: Arc::new(CodecTap::default()),
        display: Arc::new(RecordingDisplay::default()),
        led: Arc::new(RecordingLed::default()),
        iot: Arc::new(FakeIot::default()),
        platform: Arc::new(FakePlatform::default()),
        wake: Arc::new(WakeTap::default()),
    };
    let wake_word: Option<Box<dyn WakeWordDetector>> = if with_wake_word {
        Some(Box::new(FakeWakeWord {
            tap: rig.wake.clone(),
        }))
    } else {
        None
    };
    let board = Board {
        codec: Box::new(FakeCodec {
            tap: rig.codec.clone(),
            input_rate,
            output_rate,
            channels: 1,
        }),
        display: rig.display.clone(),
        led: rig.led.clone(),
        iot: rig.iot.clone(),
        platform: rig.platform.clone(),
        wake_word,
        audio_processor: None,
    };
    (board, rig)
}
