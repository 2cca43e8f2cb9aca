//! System host control.
//!
//! Reboot and shutdown go through the host's service manager; the
//! identification blink toggles a sysfs LED until stopped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use tiller_api::{HostControl, HostError};

/// Half-period of the blink pattern.
const BLINK_INTERVAL: Duration = Duration::from_millis(200);

pub struct SystemHost {
    led_path: PathBuf,
    blinking: Arc<AtomicBool>,
}

impl SystemHost {
    pub fn new(led_path: PathBuf) -> Self {
        Self {
            led_path,
            blinking: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(command: &str, args: &[&str]) -> Result<(), HostError> {
        let status = tokio::process::Command::new(command)
            .args(args)
            .status()
            .await
            .map_err(|e| HostError(format!("{command}: {e}")))?;
        if !status.success() {
            return Err(HostError(format!("{command} exited with {status}")));
        }
        Ok(())
    }

    async fn set_led(path: &PathBuf, on: bool) {
        let value = if on { "1" } else { "0" };
        if let Err(e) = tokio::fs::write(path, value).await {
            debug!(path = %path.display(), error = %e, "LED write failed");
        }
    }
}

#[async_trait]
impl HostControl for SystemHost {
    async fn reboot(&self) -> Result<(), HostError> {
        info!("invoking host reboot");
        Self::run("systemctl", &["reboot"]).await
    }

    async fn shutdown(&self) -> Result<(), HostError> {
        info!("invoking host shutdown");
        Self::run("systemctl", &["poweroff"]).await
    }

    async fn blink_start(&self) {
        if self.blinking.swap(true, Ordering::SeqCst) {
            return; // Pattern already running.
        }
        let blinking = self.blinking.clone();
        let path = self.led_path.clone();
        tokio::spawn(async move {
            let mut on = true;
            while blinking.load(Ordering::SeqCst) {
                Self::set_led(&path, on).await;
                on = !on;
                tokio::time::sleep(BLINK_INTERVAL).await;
            }
            Self::set_led(&path, false).await;
        });
    }

    async fn blink_stop(&self) {
        self.blinking.store(false, Ordering::SeqCst);
    }
}
