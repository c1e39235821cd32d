//! Long-running version check task.
//!
//! Runs on the tokio runtime next to the network tasks and talks to the
//! device core only through an [`AppHandle`].

use std::time::{Duration, Instant};

use super::Ota;
use crate::application::{lang, AppHandle};
use crate::audio::PromptSound;
use crate::config::OtaConfig;
use crate::error::OtaError;
use crate::state_machine::DeviceState;

const ACTIVATION_POLL: Duration = Duration::from_secs(1);

/// How a [`VersionChecker::run`] ended.
#[derive(Debug)]
pub enum CheckOutcome {
    /// Firmware is current and the device is activated.
    UpToDate,
    /// The server never answered within the retry budget.
    RetriesExhausted,
    /// A new image was written; a reboot has been requested.
    Upgraded,
    /// The download failed; a reboot has been requested anyway.
    UpgradeFailed(OtaError),
    /// The main loop went away.
    Stopped,
}

pub struct VersionChecker {
    ota: Ota,
    app: AppHandle,
    config: OtaConfig,
}

impl VersionChecker {
    pub fn new(ota: Ota, app: AppHandle, config: OtaConfig) -> Self {
        Self { ota, app, config }
    }

    async fn wait_until_idle(&self) {
        loop {
            tokio::time::sleep(self.config.idle_poll_interval).await;
            if self.app.device_state() == DeviceState::Idle {
                return;
            }
        }
    }

    pub async fn run(mut self) -> CheckOutcome {
        let mut retry_count = 0;
        loop {
            if let Err(e) = self.ota.check_version().await {
                retry_count += 1;
                if retry_count >= self.config.retry_max {
                    log::error!("Too many retries, exit version check");
                    return CheckOutcome::RetriesExhausted;
                }
                log::warn!(
                    "Check new version failed ({}), retry in {} seconds ({}/{})",
                    e,
                    self.config.retry_delay.as_secs(),
                    retry_count,
                    self.config.retry_max
                );
                tokio::time::sleep(self.config.retry_delay).await;
                continue;
            }
            retry_count = 0;

            let offset = self.ota.timezone_offset_minutes();
            if offset.is_some() {
                self.app.schedule(move |app| app.set_timezone_offset(offset));
            }

            if self.ota.has_new_version() {
                return self.upgrade().await;
            }

            if let Some(activation) = self.ota.take_activation() {
                if !self
                    .show_activation(&activation.code, &activation.message)
                    .await
                {
                    return CheckOutcome::Stopped;
                }
                continue;
            }

            self.ota.mark_current_version_valid();
            let version = self.ota.current_version().to_string();
            self.app
                .schedule(move |app| app.finish_version_check(&version));
            return CheckOutcome::UpToDate;
        }
    }

    /// Returns false when the main loop is gone.
    async fn show_activation(&self, code: &str, message: &str) -> bool {
        log::info!("Activation code: {}", code);
        let alert = message.to_string();
        let shown = self
            .app
            .call(move |app| {
                app.set_device_state(DeviceState::Activating);
                app.alert(lang::ACTIVATION, &alert, "happy", Some(PromptSound::Activation));
            })
            .await;
        if shown.is_none() {
            return false;
        }
        tokio::time::sleep(self.config.settle_delay).await;
        let digits = code.to_string();
        self.app
            .schedule(move |app| app.play_activation_digits(&digits));

        // 等用户在后台完成激活，超时后重新检查
        let deadline = Instant::now() + self.config.activation_window;
        loop {
            if self.app.device_state() == DeviceState::Idle {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(ACTIVATION_POLL.min(deadline - now)).await;
        }
        true
    }

    async fn upgrade(&mut self) -> CheckOutcome {
        self.app.schedule(|app| {
            app.alert(
                lang::OTA_UPGRADE,
                lang::UPGRADING,
                "happy",
                Some(PromptSound::Upgrade),
            )
        });
        self.wait_until_idle().await;

        let version = self.ota.firmware_version().to_string();
        if self
            .app
            .call(move |app| app.prepare_upgrade(&version))
            .await
            .is_none()
        {
            return CheckOutcome::Stopped;
        }
        tokio::time::sleep(self.config.settle_delay).await;

        let progress = self.app.clone();
        let result = self
            .ota
            .upgrade(move |percent, speed| {
                progress.schedule(move |app| app.show_upgrade_progress(percent, speed));
            })
            .await;

        let outcome = match result {
            Ok(()) => {
                log::info!("Firmware upgrade successful, rebooting in {:?}", self.config.reboot_delay);
                CheckOutcome::Upgraded
            }
            Err(e) => {
                log::error!("Firmware upgrade failed: {}", e);
                self.app.schedule(|app| app.upgrade_failed());
                CheckOutcome::UpgradeFailed(e)
            }
        };
        tokio::time::sleep(self.config.reboot_delay).await;
        self.app.schedule(|app| app.reboot());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Application;
    use crate::config::{ApplicationConfig, ProtocolConfig};
    use crate::dispatcher::EventDispatcher;
    use crate::ota::firmware::{build_image_prefix, FileSlots};
    use crate::ota::testing::*;
    use crate::session::testing::FakeFactory;
    use crate::state_machine::SharedDeviceState;
    use crate::testing::{board, Rig};
    use crate::audio::SoundBank;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    fn checker(backend: Arc<FakeBackend>, dir: &std::path::Path, app: AppHandle) -> VersionChecker {
        let ota = Ota::new(
            ota_config(),
            identity(),
            backend,
            Box::new(FileSlots::new(dir, "1.0.0").unwrap()),
            Arc::new(MemorySettings::default()),
            Arc::new(FakePlatform::default()),
        );
        VersionChecker::new(ota, app, ota_config())
    }

    fn running_app() -> (AppHandle, JoinHandle<()>, Rig) {
        let (board, rig) = board(16000, 16000, false);
        let app = Application::new(ApplicationConfig::default(), board, SoundBank::default()).unwrap();
        let (factory, _, _) = FakeFactory::answering(16000);
        let (handle, thread) = app
            .spawn(ProtocolConfig::default(), Box::new(factory))
            .unwrap();
        (handle, thread, rig)
    }

    async fn stop(handle: AppHandle, thread: JoinHandle<()>) {
        // let queued work run before stopping
        handle.call(|_| ()).await;
        handle.shutdown();
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_ten_failures() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::failing());
        let dispatcher = EventDispatcher::<Application>::new();
        let handle = AppHandle::new(dispatcher.scheduler(), SharedDeviceState::new(DeviceState::Idle));

        let outcome = checker(backend.clone(), dir.path(), handle).run().await;
        assert!(matches!(outcome, CheckOutcome::RetriesExhausted));
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 10);
        assert!(dispatcher.take_tasks().is_empty());
    }

    #[tokio::test]
    async fn failures_before_success_reset_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        {
            let mut manifests = backend.manifests.lock().unwrap();
            for _ in 0..9 {
                manifests.push(Err(OtaError::Network("down".into())));
            }
        }
        backend.always(json!({"firmware": {"version": "1.0.0", "url": "http://fw/1.0.0.bin"}}));
        let dispatcher = EventDispatcher::<Application>::new();
        let handle = AppHandle::new(dispatcher.scheduler(), SharedDeviceState::new(DeviceState::Idle));

        let outcome = checker(backend.clone(), dir.path(), handle).run().await;
        assert!(matches!(outcome, CheckOutcome::UpToDate));
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn current_firmware_finishes_in_idle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        backend.always(json!({
            "firmware": {"version": "1.0.0", "url": "http://fw/1.0.0.bin"},
            "server_time": {"timestamp": 1_700_000_000_000.0, "timezone_offset": 480}
        }));
        let (handle, thread, rig) = running_app();

        let outcome = checker(backend, dir.path(), handle.clone()).run().await;
        assert!(matches!(outcome, CheckOutcome::UpToDate));
        stop(handle, thread).await;

        assert_eq!(
            rig.display.notifications.lock().unwrap().as_slice(),
            &["版本 1.0.0".to_string()]
        );
        assert_eq!(rig.platform.reboots.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn activation_is_shown_then_checked_again() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        backend.push_manifest(json!({
            "firmware": {"version": "1.0.0", "url": "http://fw/1.0.0.bin"},
            "activation": {"code": "123456", "message": "xiaozhi.me 123456"}
        }));
        backend.always(json!({"firmware": {"version": "1.0.0", "url": "http://fw/1.0.0.bin"}}));
        let (handle, thread, rig) = running_app();

        let outcome = checker(backend.clone(), dir.path(), handle.clone()).run().await;
        assert!(matches!(outcome, CheckOutcome::UpToDate));
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 2);
        stop(handle.clone(), thread).await;

        assert!(rig
            .display
            .chat
            .lock()
            .unwrap()
            .contains(&("system".to_string(), "xiaozhi.me 123456".to_string())));
        let states: Vec<_> = rig.led.changes.lock().unwrap().iter().map(|c| c.0).collect();
        assert!(states.contains(&DeviceState::Activating));
        assert_eq!(states.last(), Some(&DeviceState::Idle));
    }

    #[tokio::test]
    async fn new_version_is_downloaded_then_reboots() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        backend.always(json!({"firmware": {"version": "1.1.0", "url": "http://fw/1.1.0.bin"}}));
        let mut image = build_image_prefix("1.1.0");
        image.extend_from_slice(&[0x5A; 4096]);
        *backend.firmware.lock().unwrap() = image;
        let (handle, thread, rig) = running_app();

        let outcome = checker(backend, dir.path(), handle.clone()).run().await;
        assert!(matches!(outcome, CheckOutcome::Upgraded));
        stop(handle.clone(), thread).await;

        assert_eq!(rig.platform.reboots.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("slot_b.bin").exists());
        let chat = rig.display.chat.lock().unwrap();
        assert!(chat.contains(&("system".to_string(), "新版本 1.1.0".to_string())));
        assert_eq!(chat.last().map(|c| c.1.starts_with("100%")), Some(true));
    }

    #[tokio::test]
    async fn failed_download_still_reboots() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new());
        backend.always(json!({"firmware": {"version": "1.1.0", "url": "http://fw/1.1.0.bin"}}));
        // same version inside the image
        let mut image = build_image_prefix("1.0.0");
        image.extend_from_slice(&[0; 512]);
        *backend.firmware.lock().unwrap() = image;
        let (handle, thread, rig) = running_app();

        let outcome = checker(backend, dir.path(), handle.clone()).run().await;
        assert!(matches!(
            outcome,
            CheckOutcome::UpgradeFailed(OtaError::SameVersion(_))
        ));
        stop(handle.clone(), thread).await;

        assert_eq!(rig.platform.reboots.load(Ordering::SeqCst), 1);
        assert_eq!(
            rig.display.last_status().as_deref(),
            Some(lang::UPGRADE_FAILED)
        );
    }
}
