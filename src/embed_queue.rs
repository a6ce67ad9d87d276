//! Embedding dispatcher.
//!
//! Workers never call the [`Embedder`] directly during a scan. They send
//! their chunk texts to a single dispatcher task through a bounded channel
//! and await the vectors on a oneshot reply. The dispatcher:
//!
//! 1. coalesces queued requests until a batch is full,
//! 2. deduplicates texts by content hash across those requests,
//! 3. serves hits from the persistent embedding cache,
//! 4. embeds the misses in `batch_size` slices with retry and exponential
//!    backoff on transient failures,
//! 5. stores fresh vectors in the cache and replies to every requester.
//!
//! A full channel applies backpressure to the workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use localrag_core::embedding::{validate_batch, Embedder};
use localrag_core::error::EmbeddingError;
use localrag_core::hash::sha256_hex;
use localrag_core::store::MetadataStore;

use crate::config::EmbeddingConfig;

/// Attempt budget and delay curve for transient embedder failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Call the embedder, retrying transient failures per `policy`.
///
/// Responses are checked for count and dimension; a malformed response is
/// not retried.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut attempt = 1u32;
    loop {
        match embedder.embed(texts).await {
            Ok(vectors) => {
                validate_batch(texts.len(), embedder.dims(), &vectors)?;
                return Ok(vectors);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "embedding attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(EmbeddingError::Exhausted {
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

struct EmbedRequest {
    texts: Vec<String>,
    reply: oneshot::Sender<Result<Vec<Vec<f32>>, EmbeddingError>>,
}

/// Cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct EmbedQueue {
    tx: mpsc::Sender<EmbedRequest>,
}

impl EmbedQueue {
    /// Start the dispatcher. It exits once every handle is dropped.
    pub fn spawn(
        embedder: Arc<dyn Embedder>,
        meta: Arc<dyn MetadataStore>,
        policy: RetryPolicy,
        batch_size: usize,
        depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let dispatcher = Dispatcher {
            embedder,
            meta,
            policy,
            batch_size: batch_size.max(1),
        };
        let handle = tokio::spawn(dispatcher.run(rx));
        (Self { tx }, handle)
    }

    /// Embed `texts`, one vector per text, in order.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EmbedRequest { texts, reply })
            .await
            .map_err(|_| EmbeddingError::Unavailable("embedding dispatcher stopped".to_string()))?;
        rx.await
            .map_err(|_| EmbeddingError::Unavailable("embedding dispatcher dropped request".to_string()))?
    }
}

fn pick(
    vectors: &HashMap<String, Vec<f32>>,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    texts
        .iter()
        .map(|t| {
            vectors
                .get(&sha256_hex(t.as_bytes()))
                .cloned()
                .ok_or_else(|| EmbeddingError::Unavailable("vector missing from batch".to_string()))
        })
        .collect()
}

struct Dispatcher {
    embedder: Arc<dyn Embedder>,
    meta: Arc<dyn MetadataStore>,
    policy: RetryPolicy,
    batch_size: usize,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::Receiver<EmbedRequest>) {
        while let Some(first) = rx.recv().await {
            let mut group = vec![first];
            let mut queued: usize = group[0].texts.len();
            while queued < self.batch_size {
                match rx.try_recv() {
                    Ok(req) => {
                        queued += req.texts.len();
                        group.push(req);
                    }
                    Err(_) => break,
                }
            }
            self.serve(group).await;
        }
        debug!("embedding dispatcher stopped");
    }

    async fn serve(&self, group: Vec<EmbedRequest>) {
        match self.resolve(&group).await {
            Ok(vectors) => {
                for req in group {
                    let result = pick(&vectors, &req.texts);
                    let _ = req.reply.send(result);
                }
            }
            // A permanent failure may belong to a single request.
            Err(e) if group.len() > 1 && !matches!(e, EmbeddingError::Exhausted { .. }) => {
                debug!(error = %e, requests = group.len(), "coalesced batch failed, isolating");
                for req in group {
                    let result = match self.resolve(std::slice::from_ref(&req)).await {
                        Ok(vectors) => pick(&vectors, &req.texts),
                        Err(e) => Err(e),
                    };
                    let _ = req.reply.send(result);
                }
            }
            Err(e) => {
                for req in group {
                    let _ = req.reply.send(Err(e.clone()));
                }
            }
        }
    }

    /// Vectors for every distinct text in `group`, keyed by text hash.
    async fn resolve(
        &self,
        group: &[EmbedRequest],
    ) -> Result<HashMap<String, Vec<f32>>, EmbeddingError> {
        let model = self.embedder.model_id().to_string();
        let mut resolved: HashMap<String, Vec<f32>> = HashMap::new();
        let mut misses: Vec<(String, String)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for text in group.iter().flat_map(|r| r.texts.iter()) {
            let hash = sha256_hex(text.as_bytes());
            if !seen.insert(hash.clone()) {
                continue;
            }
            match self.meta.cached_embedding(&hash, &model).await {
                Ok(Some(v)) if v.len() == self.embedder.dims() => {
                    resolved.insert(hash, v);
                }
                Ok(_) => misses.push((hash, text.clone())),
                Err(e) => {
                    warn!(error = %e, "embedding cache lookup failed");
                    misses.push((hash, text.clone()));
                }
            }
        }

        let hits = resolved.len();
        for batch in misses.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = embed_with_retry(self.embedder.as_ref(), &texts, &self.policy).await?;
            let now = chrono::Utc::now().timestamp();
            for ((hash, _), vector) in batch.iter().zip(vectors) {
                if let Err(e) = self.meta.cache_embedding(hash, &model, &vector, now).await {
                    warn!(error = %e, "failed to cache embedding");
                }
                resolved.insert(hash.clone(), vector);
            }
        }

        debug!(
            cached = hits,
            embedded = misses.len(),
            requests = group.len(),
            "embedding batch resolved"
        );
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use localrag_core::store::memory::InMemoryMetadataStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails with `failure` for the first `fail_times` calls.
    struct FlakyEmbedder {
        calls: AtomicUsize,
        texts_seen: Mutex<Vec<String>>,
        fail_times: usize,
        failure: EmbeddingError,
    }

    impl FlakyEmbedder {
        fn new(fail_times: usize, failure: EmbeddingError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_seen: Mutex::new(Vec::new()),
                fail_times,
                failure,
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_id(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(self.failure.clone());
            }
            self.texts_seen.lock().unwrap().extend(texts.iter().cloned());
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base: Duration::from_millis(250),
            max: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(1000));
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let embedder = FlakyEmbedder::new(2, EmbeddingError::Timeout);
        let out = embed_with_retry(&embedder, &["abc".to_string()], &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(out, vec![vec![3.0, 1.0]]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let embedder = FlakyEmbedder::new(10, EmbeddingError::RateLimited("429".into()));
        let err = embed_with_retry(&embedder, &["abc".to_string()], &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Exhausted { attempts: 3, .. }));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let embedder = FlakyEmbedder::new(10, EmbeddingError::Rejected("bad".into()));
        let err = embed_with_retry(&embedder, &["abc".to_string()], &fast_policy(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Rejected(_)));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_dedups_and_uses_cache() {
        let embedder = Arc::new(FlakyEmbedder::new(0, EmbeddingError::Timeout));
        let meta = Arc::new(InMemoryMetadataStore::new());
        let (queue, handle) =
            EmbedQueue::spawn(embedder.clone(), meta.clone(), fast_policy(1), 8, 4);

        let out = queue
            .embed(vec!["same".into(), "same".into(), "other!".into()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![4.0, 1.0], vec![4.0, 1.0], vec![6.0, 1.0]]);
        assert_eq!(embedder.texts_seen.lock().unwrap().len(), 2);

        // Second request is served entirely from the persistent cache.
        let out = queue.embed(vec!["other!".into()]).await.unwrap();
        assert_eq!(out, vec![vec![6.0, 1.0]]);
        assert_eq!(embedder.texts_seen.lock().unwrap().len(), 2);

        drop(queue);
        handle.await.unwrap();
    }

    /// Rejects any batch containing the text `bad`.
    struct PickyEmbedder;

    #[async_trait]
    impl Embedder for PickyEmbedder {
        fn model_id(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.iter().any(|t| t == "bad") {
                return Err(EmbeddingError::Rejected("bad input".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn rejected_request_does_not_fail_its_batch_mates() {
        let meta = Arc::new(InMemoryMetadataStore::new());
        let (queue, _handle) = EmbedQueue::spawn(Arc::new(PickyEmbedder), meta, fast_policy(1), 8, 4);
        let (good, bad) = tokio::join!(
            queue.embed(vec!["fine".into(), "also fine".into()]),
            queue.embed(vec!["bad".into()])
        );
        assert_eq!(good.unwrap().len(), 2);
        assert!(matches!(bad.unwrap_err(), EmbeddingError::Rejected(_)));
    }

    #[tokio::test]
    async fn queue_reports_exhaustion_to_requester() {
        let embedder = Arc::new(FlakyEmbedder::new(100, EmbeddingError::Timeout));
        let meta = Arc::new(InMemoryMetadataStore::new());
        let (queue, _handle) = EmbedQueue::spawn(embedder, meta, fast_policy(2), 8, 4);
        let err = queue.embed(vec!["x".into()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Exhausted { attempts: 2, .. }));
    }
}
