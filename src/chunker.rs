//! Size-bounded document chunking.
//!
//! Pure and side-effect free. Text splits prefer the last sentence
//! boundary before the bound, then the last whitespace, then a hard cut.
//! Conversation chunks are contiguous turn prefixes: a new chunk begins
//! exactly at the first turn that would overflow the bound, and a turn is
//! only ever split when it is itself larger than the bound. Chunk ids are
//! `<docID>#<n>` with `n` from 0; chunk order equals turn order.

use unicode_segmentation::UnicodeSegmentation;

use crate::model::{Document, DocumentBody, Turn, chunk_id};

/// Split every document and flatten the results in input order.
#[must_use]
pub fn chunk_documents(documents: &[Document], max_chars: usize) -> Vec<Document> {
    documents
        .iter()
        .flat_map(|doc| chunk_document(doc, max_chars))
        .collect()
}

/// Split one document into chunks whose serialization fits `max_chars`.
///
/// Documents that already fit still receive the `#0` suffix so chunk ids
/// are uniform downstream.
#[must_use]
pub fn chunk_document(document: &Document, max_chars: usize) -> Vec<Document> {
    match &document.body {
        DocumentBody::Conversation { user, people, turns } => {
            chunk_conversation(document, user, people, turns, max_chars)
        }
        DocumentBody::Text { content } => chunk_text(document, content, max_chars, None),
        DocumentBody::Media { blob_ref, description } => {
            // Media is treated as Text downstream; the blob reference
            // survives in metadata.
            chunk_text(document, description, max_chars, Some(blob_ref.as_str()))
        }
    }
}

fn chunk_text(
    document: &Document,
    content: &str,
    max_chars: usize,
    blob_ref: Option<&str>,
) -> Vec<Document> {
    split_text(content, max_chars)
        .into_iter()
        .enumerate()
        .map(|(n, piece)| {
            let mut chunk = Document::text(
                chunk_id(&document.id, n),
                document.source.clone(),
                document.timestamp,
                piece,
            );
            chunk.tags = document.tags.clone();
            chunk.metadata = document.metadata.clone();
            if let Some(blob) = blob_ref {
                chunk = chunk.with_metadata("blob_ref", blob);
            }
            chunk
        })
        .collect()
}

fn chunk_conversation(
    document: &Document,
    user: &str,
    people: &[String],
    turns: &[Turn],
    max_chars: usize,
) -> Vec<Document> {
    let mut groups: Vec<Vec<Turn>> = Vec::new();
    let mut current: Vec<Turn> = Vec::new();
    let mut current_len = 0usize;

    for turn in turns {
        let rendered = turn.rendered_len();
        if rendered > max_chars {
            // Oversized single turn: it gets chunks of its own, split as text.
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let budget = max_chars.saturating_sub(turn.speaker.chars().count() + 3).max(1);
            for piece in split_text(&turn.content, budget) {
                groups.push(vec![Turn::new(turn.speaker.clone(), turn.time, piece)]);
            }
            continue;
        }
        if current_len + rendered > max_chars && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += rendered;
        current.push(turn.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(n, group)| {
            let timestamp = group.first().map_or(document.timestamp, |t| t.time);
            let mut chunk = Document::conversation(
                chunk_id(&document.id, n),
                document.source.clone(),
                timestamp,
                user.to_string(),
                people.to_vec(),
                group,
            );
            chunk.tags = document.tags.clone();
            chunk.metadata = document.metadata.clone();
            chunk
        })
        .collect()
}

/// Split `content` into pieces of at most `max_chars` characters,
/// preferring sentence boundaries, then whitespace, then a hard cut.
/// Whitespace at split points may be dropped.
#[must_use]
pub fn split_text(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut rest = content;

    while rest.chars().count() > max_chars {
        let window_end = byte_index_of_char(rest, max_chars);
        let window = &rest[..window_end];
        let split = last_sentence_boundary(window)
            .or_else(|| last_whitespace(window))
            .unwrap_or(window_end);
        let (piece, tail) = rest.split_at(split);
        let trimmed = piece.trim_end();
        if !trimmed.is_empty() {
            pieces.push(trimmed.to_string());
        }
        rest = tail.trim_start();
    }

    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Start of the last sentence inside `window`, if splitting there makes
/// progress.
fn last_sentence_boundary(window: &str) -> Option<usize> {
    window
        .split_sentence_bound_indices()
        .map(|(idx, _)| idx)
        .filter(|idx| *idx > 0)
        .last()
}

/// Byte index of the last whitespace character in `window`.
fn last_whitespace(window: &str) -> Option<usize> {
    window
        .char_indices()
        .rev()
        .find(|(_, ch)| ch.is_whitespace())
        .map(|(idx, _)| idx)
        .filter(|idx| *idx > 0)
}

fn byte_index_of_char(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(idx, _)| idx)
}
