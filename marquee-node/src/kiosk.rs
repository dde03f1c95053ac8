use anyhow::{anyhow, Result};
use tokio::process::{Child, Command};

/// A full-screen Chromium window showing one page. The browser is killed
/// when the value is dropped.
pub struct Kiosk {
    child: Child,
    url: String,
}

impl Kiosk {
    pub fn open(binary: Option<&str>, url: &str) -> Result<Self> {
        let chrome_cmd = binary
            .map(str::to_string)
            .unwrap_or_else(find_chrome_binary);

        tracing::info!("Opening kiosk page: {}", url);
        let child = Command::new(&chrome_cmd)
            .arg("--kiosk")
            .arg("--noerrdialogs")
            .arg("--disable-infobars")
            .arg("--disable-session-crashed-bubble")
            .arg("--autoplay-policy=no-user-gesture-required")
            .arg("--incognito")
            .arg(url)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("Failed to start Chrome/Chromium ({}): {}", chrome_cmd, e))?;

        Ok(Self {
            child,
            url: url.to_string(),
        })
    }
}

impl Drop for Kiosk {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
        tracing::debug!("Closed kiosk page: {}", self.url);
    }
}

/// Find an available Chrome/Chromium binary
fn find_chrome_binary() -> String {
    for cmd in &[
        "chromium",
        "chromium-browser",
        "google-chrome",
        "google-chrome-stable",
    ] {
        if which_exists(cmd) {
            return cmd.to_string();
        }
    }
    // Default fallback
    "chromium".to_string()
}

/// Check if a command exists in PATH
fn which_exists(cmd: &str) -> bool {
    std::process::Command::new("which")
        .arg(cmd)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
