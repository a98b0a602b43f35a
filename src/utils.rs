//! Utility functions shared across the pipeline

/// Human-readable number formatting
pub mod format {
    /// Format an integer with `,` thousands separators
    pub fn thousands(value: u64) -> String {
        let digits = value.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push(',');
            }
            out.push(c);
        }
        out
    }

    /// Format a byte count with a binary unit (`1536` -> `1.50 KB`)
    pub fn human_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit = UNITS[0];
        for candidate in UNITS {
            unit = candidate;
            if size < 1024.0 {
                break;
            }
            if candidate != "TB" {
                size /= 1024.0;
            }
        }
        format!("{:.2} {}", size, unit)
    }
}

/// File I/O utilities
pub mod io {
    use std::fs;
    use std::path::Path;

    use crate::error::Result;

    /// Ensure directory exists
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Total size in bytes of every file below `path`
    pub fn directory_size<P: AsRef<Path>>(path: P) -> Result<u64> {
        let mut total = 0;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                total += directory_size(entry.path())?;
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

/// Performance timing utilities
pub mod timing {
    use std::time::{Duration, Instant};

    /// Simple timer for measuring stage durations
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start a new timer
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                start: Instant::now(),
                name: name.into(),
            }
        }

        /// Get elapsed time
        pub fn elapsed(&self) -> Duration {
            self.start.elapsed()
        }

        /// Stop timer and log result
        pub fn stop(self) -> Duration {
            let elapsed = self.elapsed();
            tracing::debug!(
                "Timer '{}' elapsed: {:.2}ms",
                self.name,
                elapsed.as_secs_f64() * 1000.0
            );
            elapsed
        }
    }
}
