//! Adapter for plain-text and Markdown note files.
//!
//! One file becomes one record. The title derives from the file stem and
//! the timestamp from the file's modification time, falling back to the
//! Unix epoch when the filesystem cannot provide one.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::SourceAdapter;
use crate::error::PipelineError;
use crate::model::Record;

pub const KEY_TITLE: &str = "title";
pub const KEY_CONTENT: &str = "content";

pub struct NotesSource;

impl NotesSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for NotesSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for NotesSource {
    fn name(&self) -> &'static str {
        "notes"
    }

    fn process_file(&self, path: &Path) -> Result<Vec<Record>, PipelineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::source(self.name(), format!("{}: {err}", path.display())))?;
        if content.trim().is_empty() {
            warn!(source = self.name(), file = %path.display(), "skipping empty note");
            return Ok(Vec::new());
        }

        let title = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();
        let timestamp = modified_at(path);
        Ok(vec![
            Record::new(timestamp, "notes")
                .with_field(KEY_TITLE, title)
                .with_field(KEY_CONTENT, content),
        ])
    }
}

fn modified_at(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
