//! Source adapters: one per export format, each parsing raw files into a
//! uniform [`Record`] stream.
//!
//! Adapters are deterministic given identical input, never mutate shared
//! state beyond logging, and emit records in timestamp-ascending order for
//! file-based sources. A malformed record is skipped with a structured
//! warning; an I/O failure aborts that adapter's run.

pub mod chat_export;
pub mod mailbox;
pub mod notes;

use std::path::Path;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

pub use chat_export::ChatExportSource;
pub use mailbox::MailboxSource;
pub use notes::NotesSource;

use crate::error::PipelineError;
use crate::model::Record;

/// One page of records from an API-backed source.
#[derive(Clone, Debug, Default)]
pub struct SyncPage {
    pub records: Vec<Record>,
    pub has_more: bool,
    pub next_token: Option<String>,
}

/// Credentials handle for API-backed sources. Owned by the caller and
/// passed explicitly; lifecycle is init/teardown on the owner.
#[derive(Clone, Debug)]
pub struct SyncSession {
    pub access_token: String,
}

impl SyncSession {
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

/// Contract every source adapter implements.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short identifier, also used as the `source` tag on emitted records.
    fn name(&self) -> &'static str;

    /// Parse one export file into records, timestamp-ascending.
    fn process_file(&self, path: &Path) -> Result<Vec<Record>, PipelineError>;

    /// Parse every regular file in `path` (sorted by file name for
    /// determinism) and merge the streams in timestamp order.
    fn process_directory(&self, path: &Path) -> Result<Vec<Record>, PipelineError> {
        let mut files: Vec<_> = std::fs::read_dir(path)
            .map_err(|err| PipelineError::source(self.name(), err.to_string()))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        let mut records = Vec::new();
        for file in files {
            records.extend(self.process_file(&file)?);
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    /// Pull one page from an API-backed source. File-based adapters keep
    /// the default, which reports the capability as unsupported.
    async fn sync(
        &self,
        _session: &SyncSession,
        _page_token: Option<&str>,
    ) -> Result<SyncPage, PipelineError> {
        Err(PipelineError::source(
            self.name(),
            "source does not support API sync",
        ))
    }
}

/// Registry of source adapters, populated at construction.
///
/// [`SourceRegistry::with_defaults`] registers every adapter the crate
/// ships; embedders add their own with [`SourceRegistry::register`].
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: FxHashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in adapters.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ChatExportSource::new()));
        registry.register(Arc::new(MailboxSource::new()));
        registry.register(Arc::new(NotesSource::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered adapter names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
