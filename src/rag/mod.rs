//! Retrieval-augmented context: query rewriting, embedding, vector search,
//! and the guardrails that sit between retrieved context and the model.

pub mod document;
pub mod embedding;
pub mod guardrails;
pub mod retriever;

pub use retriever::RagRetriever;

/// A single retrieved document chunk, with the retriever's own bookkeeping
/// attached so downstream guardrails do not have to re-derive it.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    /// Identifier of the source document.
    pub source_id: String,
    /// Identifier of the chunk within that document.
    pub chunk_id: String,
    /// Chunk text (capped to roughly 1000 characters upstream).
    pub text: String,
    /// Cosine similarity score in `[0, 1]`.
    pub score: f32,
    /// Whether the query that produced this result was rewritten as a
    /// summary query.
    pub is_summary_query: bool,
    /// The similarity threshold that was in effect when this result was
    /// retrieved.
    pub effective_threshold: f32,
}
