use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::info;

/// Cursor-home followed by erase-display, as emitted by `clear`
pub const CLEAR_SCREEN: &str = "\x1b[H\x1b[J";

/// What a flash run printed.
///
/// The display buffer mirrors a terminal and honours clear-screen; the raw
/// log keeps every stdout and stderr line and is never cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputLog {
    display: String,
    raw: String,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stdout(&mut self, line: &str) {
        self.raw.push_str(line);
        self.raw.push('\n');

        match line.strip_prefix(CLEAR_SCREEN) {
            Some(rest) => {
                self.display.clear();
                self.display.push_str(rest);
            }
            None => self.display.push_str(line),
        }
        self.display.push('\n');
    }

    pub fn push_stderr(&mut self, line: &str) {
        self.raw.push_str(line);
        self.raw.push('\n');
    }

    pub fn push_exit_trailer(&mut self, exit_code: i32) {
        self.display.push_str(&format!(
            "Error code: {}.\nPlease check the log.\n",
            exit_code
        ));
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Write the raw log as `<product>_install_log_<timestamp>.log` in `dir`
    pub fn save(&self, dir: &Path, product: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {:?}", dir))?;
        let date = Local::now().format("%Y-%m-%d-%H-%M-%S");
        let path = dir.join(format!("{}_install_log_{}.log", product, date));
        fs::write(&path, &self.raw).with_context(|| format!("Failed to write log {:?}", path))?;
        info!("Install log saved to {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_screen_resets_display_only() {
        let mut log = OutputLog::new();
        log.push_stdout("- Preparing");
        log.push_stdout(&format!("{}REST", CLEAR_SCREEN));

        assert_eq!(log.display(), "REST\n");
        assert_eq!(log.raw(), format!("- Preparing\n{}REST\n", CLEAR_SCREEN));
    }

    #[test]
    fn stderr_only_reaches_raw_log() {
        let mut log = OutputLog::new();
        log.push_stdout("ok");
        log.push_stderr("warning: something");
        assert_eq!(log.display(), "ok\n");
        assert_eq!(log.raw(), "ok\nwarning: something\n");
    }

    #[test]
    fn trailer_mentions_exit_code() {
        let mut log = OutputLog::new();
        log.push_exit_trailer(127);
        assert!(log.display().contains("Error code: 127."));
        assert!(log.raw().is_empty());
    }

    #[test]
    fn saved_log_name_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = OutputLog::new();
        log.push_stdout(&format!("{}cleared", CLEAR_SCREEN));
        log.push_stderr("err");

        let path = log.save(dir.path(), "KernelSU").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("KernelSU_install_log_"), "{name}");
        assert!(name.ends_with(".log"));
        // KernelSU_install_log_ + yyyy-MM-dd-HH-mm-ss + .log
        assert_eq!(name.len(), "KernelSU_install_log_".len() + 19 + ".log".len());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{}cleared\nerr\n", CLEAR_SCREEN)
        );
    }
}
