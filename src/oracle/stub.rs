//! Deterministic oracle fakes.
//!
//! These back the test suite and the offline paths: scripted chat
//! responses and a hash-derived embedding whose output is a pure function
//! of its input text. Both track their peak in-flight call count so tests
//! can assert the back-pressure cap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use super::{ChatOracle, CompletionRequest, CompletionResponse, EmbeddingOracle};
use crate::error::OracleError;

type ChatHandler =
    dyn Fn(&CompletionRequest) -> Result<CompletionResponse, OracleError> + Send + Sync;

/// Tracks concurrent entries into a stub oracle.
#[derive(Clone, Default)]
pub struct InFlightGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl InFlightGauge {
    fn enter(&self) -> GaugeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            current: Arc::clone(&self.current),
        }
    }

    /// Highest number of calls that were in flight simultaneously.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted chat oracle.
pub struct StubChatOracle {
    handler: Box<ChatHandler>,
    calls: AtomicUsize,
    gauge: InFlightGauge,
    /// Artificial latency per call; lets concurrency tests observe overlap.
    delay: std::time::Duration,
}

impl StubChatOracle {
    /// Answer every request with the same text.
    #[must_use]
    pub fn always(content: impl Into<String>) -> Self {
        let content = content.into();
        Self::with_handler(move |_| Ok(CompletionResponse::text(content.clone())))
    }

    /// Pop responses from a fixed script; errors once the script runs dry.
    #[must_use]
    pub fn sequence<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = CompletionResponse>,
    {
        let queue = Mutex::new(responses.into_iter().collect::<VecDeque<_>>());
        Self::with_handler(move |_| {
            queue.lock().pop_front().ok_or(OracleError::Malformed {
                message: "stub script exhausted".into(),
            })
        })
    }

    /// Full control over the response per request.
    #[must_use]
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, OracleError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            gauge: InFlightGauge::default(),
            delay: std::time::Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn gauge(&self) -> InFlightGauge {
        self.gauge.clone()
    }
}

#[async_trait]
impl ChatOracle for StubChatOracle {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, OracleError> {
        let _guard = self.gauge.enter();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&request)
    }
}

/// Embedding oracle whose vector is a pure function of the input text.
///
/// Character n-grams are hashed into a fixed number of buckets and the
/// resulting histogram is L2-normalized, so near-identical texts land
/// close together under cosine distance and identical texts coincide.
pub struct HashEmbeddingOracle {
    dim: usize,
    gauge: InFlightGauge,
    delay: std::time::Duration,
}

impl HashEmbeddingOracle {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            gauge: InFlightGauge::default(),
            delay: std::time::Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn gauge(&self) -> InFlightGauge {
        self.gauge.clone()
    }

    #[must_use]
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();
        if chars.is_empty() || self.dim == 0 {
            return vector;
        }
        for window in chars.windows(3.min(chars.len())) {
            let mut hasher = FxHasher::default();
            window.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dim;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingOracle for HashEmbeddingOracle {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError> {
        let _guard = self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ChatMessage;

    #[tokio::test]
    async fn sequence_pops_in_order_then_errors() {
        let oracle = StubChatOracle::sequence(vec![
            CompletionResponse::text("one"),
            CompletionResponse::text("two"),
        ]);
        let req = CompletionRequest::new(vec![ChatMessage::user("x")]);
        assert_eq!(oracle.complete(req.clone()).await.unwrap().content, "one");
        assert_eq!(oracle.complete(req.clone()).await.unwrap().content, "two");
        assert!(oracle.complete(req).await.is_err());
        assert_eq!(oracle.call_count(), 3);
    }

    #[tokio::test]
    async fn hash_embedding_is_deterministic_and_normalized() {
        let oracle = HashEmbeddingOracle::new(64);
        let a = oracle.embed(&["Alice lives in Paris.".into()]).await.unwrap();
        let b = oracle.embed(&["Alice lives in Paris.".into()]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn different_texts_differ() {
        let oracle = HashEmbeddingOracle::new(64);
        let out = oracle
            .embed(&["alpha beta gamma".into(), "totally different words".into()])
            .await
            .unwrap();
        assert_ne!(out[0], out[1]);
    }
}
