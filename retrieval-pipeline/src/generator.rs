//! Grounded answer generation. An evidence-sufficiency gate guards the
//! model call; context items are numbered `[i]` and citations are bound to
//! the retrieved evidence. Streaming yields the token stream unchanged,
//! then a final `citations` frame derived from the context; `done = true`
//! is delivered on every exit path.

use std::sync::Arc;

use common::{
    config::GroundingSettings,
    error::RagError,
    providers::ChatModel,
    types::{Citation, GroundedAnswer, StreamFrame, ValidityWindow},
};
use futures::{Stream, StreamExt};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{ContextItem, RankedItem};

pub const REFUSAL: &str = "I don't have enough information to answer that question.";

const EVIDENCE_SATURATION_CHARS: usize = 10_000;

/// Bounded function of total evidence length, in `[0, 1]`.
pub fn evidence_score(context: &[RankedItem]) -> f64 {
    if context.is_empty() {
        return 0.0;
    }
    let total: usize = context.iter().map(|c| c.item.display_text().len()).sum();
    (total as f64 / EVIDENCE_SATURATION_CHARS as f64).min(1.0)
}

fn render_context(context: &[RankedItem]) -> String {
    context
        .iter()
        .enumerate()
        .map(|(i, candidate)| match &candidate.item {
            ContextItem::Edge { edge } => format!(
                "[{}] {} (valid from {} to {})",
                i + 1,
                edge.edge_type,
                edge.t_valid_start.to_rfc3339(),
                edge.t_valid_end.to_rfc3339()
            ),
            ContextItem::Chunk { chunk } => format!("[{}] {}", i + 1, chunk.text),
        })
        .collect::<Vec<String>>()
        .join("\n\n")
}

fn build_prompt(query: &str, context_block: &str) -> String {
    format!(
        "Answer the query based ONLY on the provided context.\n\
         For each claim in your answer, cite the specific source using [number].\n\
         If the context doesn't contain enough information, say so.\n\n\
         Context:\n{context_block}\n\nQuery: {query}"
    )
}

pub fn citation_for(item: &ContextItem) -> Citation {
    match item {
        ContextItem::Chunk { chunk } => Citation::Chunk {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: chunk.doc_id.clone(),
            source_tool: chunk.source_tool.clone(),
            ts_source: chunk.ts_source,
        },
        ContextItem::Edge { edge } => Citation::Edge {
            edge_id: edge.id.clone(),
            relation: edge.edge_type.clone(),
            validity: ValidityWindow {
                start: edge.t_valid_start,
                end: edge.t_valid_end,
            },
            source_tool: edge.provenance.source_tool.clone(),
        },
    }
}

/// Scans the answer for `[i]` markers and resolves each in-range marker to
/// its context item, unique, in answer order.
pub fn extract_citations(answer: &str, context: &[RankedItem]) -> Vec<Citation> {
    let Ok(pattern) = Regex::new(r"\[(\d+)\]") else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    let mut citations = Vec::new();
    for capture in pattern.captures_iter(answer) {
        let Some(index) = capture.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) else {
            continue;
        };
        if index == 0 || index > context.len() || !seen.insert(index) {
            continue;
        }
        if let Some(candidate) = context.get(index - 1) {
            citations.push(citation_for(&candidate.item));
        }
    }
    citations
}

pub struct GroundedGenerator {
    model: Arc<dyn ChatModel>,
    settings: GroundingSettings,
}

impl GroundedGenerator {
    pub fn new(model: Arc<dyn ChatModel>, settings: GroundingSettings) -> Self {
        Self { model, settings }
    }

    #[instrument(skip_all, fields(context_items = context.len()))]
    pub async fn generate(
        &self,
        query: &str,
        context: &[RankedItem],
    ) -> Result<GroundedAnswer, RagError> {
        let score = evidence_score(context);
        if score < self.settings.min_evidence_score {
            debug!(score, "insufficient evidence; refusing");
            return Ok(GroundedAnswer {
                answer: REFUSAL.to_owned(),
                citations: Vec::new(),
                has_sufficient_evidence: false,
                evidence_score: score,
            });
        }

        let prompt = build_prompt(query, &render_context(context));
        let answer = self.model.generate(&prompt).await?;
        let citations = extract_citations(&answer, context);
        debug!(citations = citations.len(), "answer generated");

        Ok(GroundedAnswer {
            answer,
            citations,
            has_sufficient_evidence: true,
            evidence_score: score,
        })
    }

    /// Streaming variant. The final `citations` frame is derived from the
    /// full context rather than the answer, so clients can display sources
    /// without waiting for the model.
    pub fn generate_stream(
        &self,
        query: String,
        context: Vec<RankedItem>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = StreamFrame> + Send + 'static {
        let model = Arc::clone(&self.model);
        let min_evidence_score = self.settings.min_evidence_score;

        async_stream::stream! {
            let score = evidence_score(&context);
            if score < min_evidence_score {
                yield StreamFrame::answer(REFUSAL, true);
                return;
            }

            let prompt = build_prompt(&query, &render_context(&context));
            let mut tokens = match model.generate_stream(&prompt).await {
                Ok(tokens) => tokens,
                Err(err) => {
                    yield StreamFrame::error(err.kind(), err.to_string());
                    return;
                }
            };

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        yield StreamFrame::cancelled();
                        return;
                    }
                    token = tokens.next() => match token {
                        None => break,
                        Some(Ok(content)) => yield StreamFrame::answer(content, false),
                        Some(Err(err)) => {
                            yield StreamFrame::error(err.kind(), err.to_string());
                            return;
                        }
                    }
                }
            }

            let citations: Vec<_> = context.iter().map(|c| citation_for(&c.item)).collect();
            yield StreamFrame::citations(&citations);
        }
    }
}
