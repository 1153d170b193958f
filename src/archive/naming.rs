// src/archive/naming.rs

use std::path::PathBuf;

use chrono::NaiveDateTime;

use super::NamingPolicy;

/// `<root>/<YYYY>/<MM>/<DD>/<prefix>_<YYYY>-<MM>-<DD>_<HHMMSS>.<ext>`
#[derive(Debug, Clone)]
pub struct HourlyLayout {
    root: PathBuf,
    prefix: String,
    extension: String,
}

impl HourlyLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn day_dir(&self, ts: NaiveDateTime) -> PathBuf {
        self.root.join(ts.format("%Y/%m/%d").to_string())
    }

    pub fn file_name(&self, ts: NaiveDateTime) -> String {
        format!(
            "{}_{}.{}",
            self.prefix,
            ts.format("%Y-%m-%d_%H%M%S"),
            self.extension
        )
    }
}

impl NamingPolicy for HourlyLayout {
    fn destination(&self, ts: NaiveDateTime) -> PathBuf {
        self.day_dir(ts).join(self.file_name(ts))
    }
}
