//! Query rewriting, cached embedding, and threshold-adaptive vector search.

use crate::adapters::{Embedder, VectorStore};
use crate::rag::RetrievalResult;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// FIFO embedding cache capacity.
const CACHE_CAPACITY: usize = 100;

/// Similarity threshold used while searching a rewritten summary query.
const SUMMARY_MIN_SCORE: f32 = 0.05;

struct EmbeddingCache {
    order: VecDeque<String>,
    entries: std::collections::HashMap<String, Vec<f32>>,
}

impl EmbeddingCache {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            entries: std::collections::HashMap::new(),
        }
    }

    fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Vec<f32>) {
        if self.entries.contains_key(&key) {
            return;
        }
        if self.entries.len() >= CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handles query rewriting, cached embedding, and vector search for RAG.
pub struct RagRetriever {
    vector_store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    min_similarity: f32,
    cache: Mutex<EmbeddingCache>,
}

impl RagRetriever {
    /// Create a retriever over the given vector store and embedder.
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        top_k: usize,
        min_similarity: f32,
    ) -> Self {
        info!("initialized RAG retriever: top_k={top_k}, min_similarity={min_similarity}");
        Self {
            vector_store,
            embedder,
            top_k,
            min_similarity,
            cache: Mutex::new(EmbeddingCache::new()),
        }
    }

    /// Retrieve relevant chunks for `query`, bounded by `timeout_ms`.
    ///
    /// Never fails the caller's turn: on timeout or internal error this
    /// returns an empty list.
    pub async fn retrieve(&self, query: &str, session_id: &str, timeout_ms: u64) -> Vec<RetrievalResult> {
        let deadline = std::time::Duration::from_millis(timeout_ms);
        match tokio::time::timeout(deadline, self.retrieve_internal(query, session_id)).await {
            Ok(results) => results,
            Err(_) => {
                warn!("RAG retrieval timeout after {timeout_ms}ms for query: {}", truncate(query));
                Vec::new()
            }
        }
    }

    async fn retrieve_internal(&self, query: &str, session_id: &str) -> Vec<RetrievalResult> {
        let (rewritten, is_summary) = rewrite_query_if_needed(query);
        if rewritten != query {
            info!("query rewrite: '{}' -> '{rewritten}' (summary={is_summary})", truncate(query));
        }

        let min_similarity = if is_summary { SUMMARY_MIN_SCORE } else { self.min_similarity };
        let top_k = if is_summary { self.top_k * 2 } else { self.top_k };

        let embedding = match self.embed_cached(&rewritten).await {
            Some(e) => e,
            None => {
                warn!("failed to generate query embedding");
                return Vec::new();
            }
        };

        let mut results = match self
            .vector_store
            .search(&embedding, session_id, top_k, min_similarity)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("vector search failed: {e}");
                return Vec::new();
            }
        };

        if is_summary && results.len() > self.top_k {
            results.truncate(self.top_k);
        }

        for r in &mut results {
            r.is_summary_query = is_summary;
            r.effective_threshold = min_similarity;
        }

        if results.is_empty() {
            warn!("no results above threshold {min_similarity:.2} for query: {}", truncate(query));
        }

        results
    }

    async fn embed_cached(&self, query: &str) -> Option<Vec<f32>> {
        let key = query.to_lowercase().trim().to_owned();

        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                debug!("embedding cache hit");
                return Some(hit);
            }
        }

        let embedding = self.embedder.embed(query).await.ok()?;
        self.cache.lock().await.insert(key, embedding.clone());
        Some(embedding)
    }

    /// Clear the embedding cache.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        info!("cleared embedding cache");
    }

    /// Current number of cached embeddings.
    pub async fn cache_size(&self) -> usize {
        self.cache.lock().await.len()
    }
}

const SUMMARY_REPLACEMENT: &str = "main topics key points important information";

/// Patterns whose match rewrites the whole query to [`SUMMARY_REPLACEMENT`]
/// and sets `is_summary_query`.
fn summary_patterns() -> &'static [regex::Regex] {
    static PATTERNS: std::sync::OnceLock<Vec<regex::Regex>> = std::sync::OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^(give me |can you |please )?(a |an )?(summary|overview|brief)",
            r"^summarize (the |this )?(document|file|text|pdf|content)",
            r"^what (is|are) (the )?(main|key) (points?|topics?|ideas?)",
            r"^(tell me |show me )?what.s in (the |this )?(document|file)",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).expect("static summary pattern compiles"))
        .collect()
    })
}

/// `(pattern, replacement)` pairs applied in order to strip filler phrases.
fn filler_patterns() -> &'static [(regex::Regex, &'static str)] {
    static PATTERNS: std::sync::OnceLock<Vec<(regex::Regex, &'static str)>> = std::sync::OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                regex::Regex::new(r"^(tell me about|show me|explain|describe)\s+").expect("static pattern"),
                "",
            ),
            (
                regex::Regex::new(r"^(can you |could you |please |would you )+(tell|show|explain|describe)\s+")
                    .expect("static pattern"),
                "",
            ),
            (
                regex::Regex::new(r"\s+(please|thanks|thank you)$").expect("static pattern"),
                "",
            ),
        ]
    })
}

const SUMMARY_KEYWORDS: &[&str] = &[
    "summarize",
    "summary",
    "overview",
    "brief",
    "main points",
    "key points",
    "what does it say",
    "what is in",
    "tell me about the document",
];

/// Rewrite a command-style query into a semantic one, returning
/// `(rewritten, is_summary_query)`.
fn rewrite_query_if_needed(query: &str) -> (String, bool) {
    let lower = query.to_lowercase();
    let trimmed = lower.trim();

    for pattern in summary_patterns() {
        if pattern.is_match(trimmed) {
            return (SUMMARY_REPLACEMENT.to_owned(), true);
        }
    }

    let mut rewritten = trimmed.to_owned();
    let mut modified = false;
    for (pattern, replacement) in filler_patterns() {
        let new_text = pattern.replace(&rewritten, *replacement).trim().to_owned();
        if new_text != rewritten {
            rewritten = new_text;
            modified = true;
        }
    }

    let is_summary = SUMMARY_KEYWORDS.iter().any(|phrase| trimmed.contains(phrase));

    let final_query = if modified { rewritten } else { query.to_owned() };
    (final_query, is_summary)
}

fn truncate(s: &str) -> String {
    crate::text::truncate_with_ellipsis(s, 50)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_pattern_detected() {
        let (rewritten, is_summary) = rewrite_query_if_needed("give me a summary");
        assert!(is_summary);
        assert_eq!(rewritten, "main topics key points important information");
    }

    #[test]
    fn summarize_document_pattern() {
        let (_, is_summary) = rewrite_query_if_needed("summarize the document please");
        assert!(is_summary);
    }

    #[test]
    fn main_points_pattern() {
        let (_, is_summary) = rewrite_query_if_needed("what are the main points");
        assert!(is_summary);
    }

    #[test]
    fn filler_stripped() {
        let (rewritten, is_summary) = rewrite_query_if_needed("tell me about the weather");
        assert_eq!(rewritten, "the weather");
        assert!(!is_summary);
    }

    #[test]
    fn polite_filler_stripped() {
        let (rewritten, _) = rewrite_query_if_needed("can you explain quantum computing");
        assert_eq!(rewritten, "quantum computing");
    }

    #[test]
    fn trailing_courtesy_stripped() {
        let (rewritten, _) = rewrite_query_if_needed("what time is it please");
        assert_eq!(rewritten, "what time is it");
    }

    #[test]
    fn unrelated_query_unchanged() {
        let (rewritten, is_summary) = rewrite_query_if_needed("what color is the sky");
        assert_eq!(rewritten, "what color is the sky");
        assert!(!is_summary);
    }

    #[tokio::test]
    async fn cache_evicts_fifo() {
        let mut cache = EmbeddingCache::new();
        for i in 0..CACHE_CAPACITY + 5 {
            cache.insert(format!("q{i}"), vec![i as f32]);
        }
        assert_eq!(cache.len(), CACHE_CAPACITY);
        assert!(cache.get("q0").is_none());
        assert!(cache.get(&format!("q{}", CACHE_CAPACITY + 4)).is_some());
    }
}
