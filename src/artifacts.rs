//! Optional JSON artifacts for debugging intermediate pipeline state.
//!
//! Three files under the output directory mirror the first three stages:
//! `X1_documents.json`, `X1p_chunks.json`, `X2_facts.json`. Each carries
//! a stable envelope with `metadata.step` and `metadata.processed_at`
//! (RFC 3339) around the serialized items.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::PipelineError;

/// Which artifact a payload belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactStep {
    ToDocuments,
    ChunkDocuments,
    ExtractFacts,
}

impl ArtifactStep {
    #[must_use]
    pub fn step_name(self) -> &'static str {
        match self {
            ArtifactStep::ToDocuments => "to_documents",
            ArtifactStep::ChunkDocuments => "chunk_documents",
            ArtifactStep::ExtractFacts => "extract_facts",
        }
    }

    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactStep::ToDocuments => "X1_documents.json",
            ArtifactStep::ChunkDocuments => "X1p_chunks.json",
            ArtifactStep::ExtractFacts => "X2_facts.json",
        }
    }
}

#[derive(Serialize)]
struct ArtifactEnvelope<'a, T: Serialize> {
    metadata: ArtifactMetadata,
    items: &'a [T],
}

#[derive(Serialize)]
struct ArtifactMetadata {
    step: &'static str,
    processed_at: String,
}

/// Write one artifact file, creating the output directory if needed.
/// Returns the path written.
pub fn write_artifact<T: Serialize>(
    output_dir: &Path,
    step: ArtifactStep,
    items: &[T],
) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(output_dir)?;
    let envelope = ArtifactEnvelope {
        metadata: ArtifactMetadata {
            step: step.step_name(),
            processed_at: Utc::now().to_rfc3339(),
        },
        items,
    };
    let path = output_dir.join(step.file_name());
    let payload = serde_json::to_string_pretty(&envelope)?;
    std::fs::write(&path, payload)?;
    info!(path = %path.display(), step = step.step_name(), count = items.len(), "wrote artifact");
    Ok(path)
}
