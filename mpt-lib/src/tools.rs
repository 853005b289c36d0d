use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Render a byte count as a human readable size with two decimals.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let bytes_f = bytes as f64;
    if bytes_f < KB {
        format!("{}Bytes", bytes)
    } else if bytes_f < MB {
        format!("{:.2}KB", bytes_f / KB)
    } else if bytes_f < GB {
        format!("{:.2}MB", bytes_f / MB)
    } else {
        format!("{:.2}GB", bytes_f / GB)
    }
}

/// Plain-text operational log, one `[timestamp] message` line per append.
/// Informational only; append failures are logged and swallowed.
#[derive(Debug, Clone)]
pub struct OpLog {
    path: PathBuf,
}

impl OpLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{}] {}\n", timestamp, message);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(
                "OpLog: append to {} failed: {}",
                self.path.to_string_lossy(),
                e
            );
        }
    }
}
