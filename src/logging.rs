use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Run-wide output channel. Progress goes to stdout, warnings and errors to
/// stderr, and debug lines to stderr plus an optional debug file.
pub struct Logger {
    debug_enabled: bool,
    debug_file: Option<RefCell<File>>,
}

impl Logger {
    pub fn new(debug_enabled: bool) -> Self {
        Self {
            debug_enabled,
            debug_file: None,
        }
    }

    pub fn with_debug_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open debug file {}", path.display()))?;
        Ok(Self {
            debug_enabled: true,
            debug_file: Some(RefCell::new(file)),
        })
    }

    pub fn info(&self, message: &str) {
        println!("{message}");
        self.append_debug_file(message);
    }

    pub fn warn(&self, message: &str) {
        eprintln!("repos: warning: {message}");
        self.append_debug_file(&format!("warning: {message}"));
    }

    pub fn error(&self, message: &str) {
        eprintln!("repos: error: {message}");
        self.append_debug_file(&format!("error: {message}"));
    }

    pub fn debug(&self, message: &str) {
        if self.debug_enabled {
            eprintln!("[debug] {message}");
        }
        self.append_debug_file(&format!("debug: {message}"));
    }

    fn append_debug_file(&self, message: &str) {
        if let Some(file) = &self.debug_file {
            let _ = writeln!(file.borrow_mut(), "{message}");
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(false)
    }
}
