//! Retrieval and generation against a [`RetrievalHandle`].
//!
//! The executor never touches the coordinator's lock: it only reads the
//! immutable handle it is given, so any number of queries run in parallel,
//! including against handles that a later rebuild has already superseded.
//!
//! Generation uses the "stuff" strategy: every retrieved chunk is pasted,
//! separated by blank lines, into one question-answering prompt, and the
//! model is called once.

use kb_harness_core::index::ScoredChunk;
use serde::Serialize;

use crate::coordinator::RetrievalHandle;
use crate::error::PipelineError;

/// Question-answering template. `{context}` receives the retrieved chunks,
/// `{question}` the caller's prompt.
pub const STUFF_TEMPLATE: &str = "Use the following pieces of context to answer the question at the end. If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\n{context}\n\nQuestion: {question}\nHelpful Answer:";

/// A generated answer with the chunks that were fed to the model.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub source: String,
    pub sequence_index: usize,
    pub score: f32,
}

impl From<&ScoredChunk> for SourceRef {
    fn from(hit: &ScoredChunk) -> Self {
        Self {
            source: hit.chunk.source.clone(),
            sequence_index: hit.chunk.sequence_index,
            score: hit.score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryExecutor {
    template: String,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self::with_template(STUFF_TEMPLATE)
    }

    /// Use a custom template containing `{context}` and `{question}`.
    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Top-k chunks for `query` under the handle's search settings.
    ///
    /// An empty index returns no chunks without calling the embedder.
    pub async fn retrieve(
        &self,
        handle: &RetrievalHandle,
        query: &str,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let index = handle.index();
        if index.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = handle
            .embedder()
            .embed(&[query.to_string()])
            .await
            .map_err(PipelineError::Embedding)?;
        let query_vec = vectors.into_iter().next().ok_or_else(|| {
            PipelineError::Embedding(anyhow::anyhow!("Empty embedding response"))
        })?;

        let retriever = handle.retriever();
        index
            .search(&query_vec, retriever.k, &retriever.mode)
            .map_err(PipelineError::Retrieval)
    }

    /// Render the template for `question` over `hits`.
    pub fn assemble(&self, hits: &[ScoredChunk], question: &str) -> String {
        let context = hits
            .iter()
            .map(|h| h.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        render(&self.template, &context, question)
    }

    /// Retrieve, assemble, and generate, keeping the retrieved sources.
    pub async fn answer(
        &self,
        handle: &RetrievalHandle,
        prompt: &str,
    ) -> Result<Answer, PipelineError> {
        let hits = self.retrieve(handle, prompt).await?;
        let input = self.assemble(&hits, prompt);
        tracing::debug!(
            fingerprint = handle.fingerprint().short(),
            retrieved = hits.len(),
            prompt_chars = input.len(),
            model = handle.model().model_name(),
            "calling language model"
        );

        let text = handle
            .model()
            .generate(&input)
            .await
            .map_err(PipelineError::Model)?;
        Ok(Answer {
            text,
            sources: hits.iter().map(SourceRef::from).collect(),
        })
    }

    /// Retrieve, assemble, and generate.
    pub async fn execute(
        &self,
        handle: &RetrievalHandle,
        prompt: &str,
    ) -> Result<String, PipelineError> {
        Ok(self.answer(handle, prompt).await?.text)
    }
}

/// Substitute `{context}` and `{question}` in one left-to-right pass, so
/// placeholder text inside the substituted values is left as-is.
fn render(template: &str, context: &str, question: &str) -> String {
    let slots = [("{context}", context), ("{question}", question)];
    let mut out = String::with_capacity(template.len() + context.len() + question.len());
    let mut rest = template;
    loop {
        let next = slots
            .iter()
            .filter_map(|(slot, value)| rest.find(slot).map(|at| (at, *slot, *value)))
            .min_by_key(|(at, _, _)| *at);
        match next {
            Some((at, slot, value)) => {
                out.push_str(&rest[..at]);
                out.push_str(value);
                rest = &rest[at + slot.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_harness_core::models::Chunk;

    fn hit(content: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                content: content.to_string(),
                source: "a.txt".to_string(),
                sequence_index: 0,
            },
            score: 1.0,
        }
    }

    #[test]
    fn test_assemble_stuffs_all_chunks() {
        let executor = QueryExecutor::new();
        let prompt = executor.assemble(&[hit("first"), hit("second")], "What now?");
        assert!(prompt.starts_with("Use the following pieces of context"));
        assert!(prompt.contains("\n\nfirst\n\nsecond\n\n"));
        assert!(prompt.ends_with("Question: What now?\nHelpful Answer:"));
    }

    #[test]
    fn test_custom_template() {
        let executor = QueryExecutor::with_template("[{context}] {question}");
        assert_eq!(executor.assemble(&[hit("c")], "q"), "[c] q");
        assert_eq!(executor.assemble(&[], "q"), "[] q");
    }

    #[test]
    fn test_placeholders_inside_chunks_left_alone() {
        let executor = QueryExecutor::with_template("[{context}] {question}");
        let prompt = executor.assemble(&[hit("fmt uses {question} and {context}")], "q?");
        assert_eq!(prompt, "[fmt uses {question} and {context}] q?");
    }
}
