use std::fs;
use std::path::{Path, PathBuf};

use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::Tab;
use tracing::{info, warn};

/// Best-effort UI snapshot for post-mortem diagnosis. The pipeline only
/// triggers capture; it never interprets the result, and capture failures
/// must not alter control flow.
pub fn capture(tab: &Tab, dir: Option<&Path>, label: &str) {
    let Some(dir) = dir else {
        return;
    };
    match try_capture(tab, dir, label) {
        Ok(path) => info!(path = %path.display(), "saved ui snapshot"),
        Err(err) => warn!(label, %err, "ui snapshot capture failed"),
    }
}

fn try_capture(tab: &Tab, dir: &Path, label: &str) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let png = tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
    let path = dir.join(format!("{label}.png"));
    fs::write(&path, png)?;
    Ok(path)
}
