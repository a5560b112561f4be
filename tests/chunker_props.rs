//! Property tests for the chunker invariants: size bound, content
//! coverage modulo whitespace, and turn integrity.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use memloom::chunker::{chunk_document, split_text};
use memloom::model::{Document, DocumentBody, Turn};

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

proptest! {
    #[test]
    fn split_pieces_respect_the_bound(
        content in "[a-zA-Z0-9 .!?]{0,400}",
        max in 8usize..120,
    ) {
        for piece in split_text(&content, max) {
            prop_assert!(piece.chars().count() <= max);
        }
    }

    #[test]
    fn split_covers_content_modulo_whitespace(
        content in "[a-zA-Z0-9 .!?]{0,400}",
        max in 8usize..120,
    ) {
        let pieces = split_text(&content, max);
        let rejoined: String = pieces.concat();
        prop_assert_eq!(strip_whitespace(&rejoined), strip_whitespace(&content));
    }

    #[test]
    fn text_chunks_cover_the_document(
        content in "[a-zA-Z0-9 .!?]{1,600}",
        max in 16usize..200,
    ) {
        let doc = Document::text("t:prop", "t", Utc::now(), content.clone());
        let chunks = chunk_document(&doc, max);
        let mut rejoined = String::new();
        for (n, chunk) in chunks.iter().enumerate() {
            let expected_id = format!("t:prop#{n}");
            prop_assert_eq!(chunk.id.as_str(), expected_id.as_str());
            prop_assert!(chunk.content_len() <= max);
            rejoined.push_str(&chunk.content_text());
        }
        prop_assert_eq!(strip_whitespace(&rejoined), strip_whitespace(&content));
    }

    #[test]
    fn conversation_turns_stay_whole(
        texts in prop::collection::vec("[a-z ]{1,40}", 1..40),
        max in 120usize..400,
    ) {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let turns: Vec<Turn> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Turn::new("s", base + chrono::Duration::seconds(i as i64), t.clone()))
            .collect();
        let doc = Document::conversation(
            "c:prop",
            "chat",
            base,
            "me",
            vec!["s".into()],
            turns.clone(),
        );

        let chunks = chunk_document(&doc, max);
        let mut seen: Vec<String> = Vec::new();
        for chunk in &chunks {
            prop_assert!(chunk.content_len() <= max);
            let DocumentBody::Conversation { turns: chunk_turns, .. } = &chunk.body else {
                panic!("expected conversation chunk");
            };
            for turn in chunk_turns {
                seen.push(turn.content.clone());
            }
        }
        // Every turn fits the bound here, so each appears exactly once,
        // in order.
        let expected: Vec<String> = turns.into_iter().map(|t| t.content).collect();
        prop_assert_eq!(seen, expected);
    }
}
