//! Linux host [`Platform`].
//!
//! There is no power management or RTC to drive from an unprivileged
//! process, so those calls are logged. A reboot ends the process; the
//! service manager starts it again from the new boot slot.

use std::sync::Arc;
use tokio::sync::Notify;

use crate::board::Platform;

pub struct HostPlatform {
    reboot: Arc<Notify>,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            reboot: Arc::new(Notify::new()),
        }
    }

    /// Resolves once a reboot was requested.
    pub fn reboot_requested(&self) -> Arc<Notify> {
        self.reboot.clone()
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HostPlatform {
    fn set_power_save_mode(&self, enabled: bool) {
        log::debug!("Power save mode: {}", enabled);
    }

    fn reboot(&self) {
        log::info!("Reboot requested");
        self.reboot.notify_one();
    }

    fn set_system_time_ms(&self, utc_ms: i64, offset_minutes: i64) {
        // 主机时钟由系统维护，这里只记录
        log::info!("Server time: {} ms (UTC{:+} min)", utc_ms, offset_minutes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reboot_wakes_waiter() {
        let platform = HostPlatform::new();
        let requested = platform.reboot_requested();
        platform.reboot();
        // notify_one stores a permit when nobody is waiting yet
        tokio::time::timeout(std::time::Duration::from_secs(1), requested.notified())
            .await
            .unwrap();
    }
}
