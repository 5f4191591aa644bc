//! Paragraph-greedy chunking. Content splits on blank lines; a buffer
//! fills up to `chunk_size` whitespace tokens, and each emitted chunk seeds
//! the next with its trailing `chunk_overlap` tokens.

use chrono::Utc;
use common::{
    config::ChunkingSettings,
    types::{Chunk, Document},
};

pub const CHUNKER_VERSION: &str = "1.0";

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn split_greedy(content: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for paragraph in content.split("\n\n") {
        let paragraph_tokens = token_count(paragraph);
        if current_tokens + paragraph_tokens > chunk_size && !current.is_empty() {
            let words: Vec<&str> = current.split_whitespace().collect();
            let tail_start = words.len().saturating_sub(chunk_overlap);
            let tail = words.get(tail_start..).unwrap_or(&[]).join(" ");
            chunks.push(std::mem::take(&mut current));

            if tail.is_empty() {
                current = paragraph.to_owned();
                current_tokens = paragraph_tokens;
            } else {
                current = format!("{tail}\n\n{paragraph}");
                current_tokens = token_count(&tail) + paragraph_tokens;
            }
        } else if current.is_empty() {
            current = paragraph.to_owned();
            current_tokens = paragraph_tokens;
        } else {
            current.push_str("\n\n");
            current.push_str(paragraph);
            current_tokens += paragraph_tokens;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks.retain(|chunk| token_count(chunk) > 0);
    chunks
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    pub fn from_settings(settings: &ChunkingSettings) -> Self {
        Self::new(settings.chunk_size, settings.chunk_overlap)
    }

    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        self.chunk_scoped(document, None)
    }

    fn chunk_scoped(&self, document: &Document, size_scope: Option<usize>) -> Vec<Chunk> {
        let now = Utc::now();
        split_greedy(&document.content, self.chunk_size, self.chunk_overlap)
            .into_iter()
            .map(|text| {
                let chunk_id = match size_scope {
                    Some(size) => Chunk::deterministic_id_scoped(&document.id, &text, size),
                    None => Chunk::deterministic_id(&document.id, &text),
                };
                let tokens = token_count(&text);
                Chunk {
                    chunk_id,
                    doc_id: document.id.clone(),
                    text,
                    tokens,
                    tenant_id: document.tenant_id.clone(),
                    source_tool: document.source_tool.clone(),
                    source_id: document.source_id.clone(),
                    acl: document.acl.clone(),
                    ts_source: document.ts_source,
                    ts_chunked: now,
                    chunker_version: CHUNKER_VERSION.to_owned(),
                    embedding: None,
                    embedding_model: None,
                    embedding_version: None,
                    ts_embedded: None,
                }
            })
            .collect()
    }

    /// Multi-size chunking: v1 runs independently per size, ids scoped by
    /// size so cross-size collisions are impossible.
    pub fn chunk_multi_size(
        document: &Document,
        sizes: &[usize],
        overlap_ratio: f64,
    ) -> Vec<Chunk> {
        sizes
            .iter()
            .flat_map(|&size| {
                let overlap = (size as f64 * overlap_ratio) as usize;
                Chunker::new(size, overlap).chunk_scoped(document, Some(size))
            })
            .collect()
    }
}
