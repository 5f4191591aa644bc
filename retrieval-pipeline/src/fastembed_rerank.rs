//! Local cross-encoder backed by fastembed, pooled behind a semaphore so a
//! bounded number of reranks run at once. Opt-in via the `fastembed`
//! feature; deployments without local models inject a remote
//! `CrossEncoderModel` instead.

use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use common::{error::RagError, providers::CrossEncoderModel};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    NEXT_ENGINE.fetch_add(1, Ordering::Relaxed) % pool_len
}

pub struct FastembedCrossEncoder {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    model_name: String,
}

impl FastembedCrossEncoder {
    /// Builds `pool_size` engines at startup; each rerank checks out one
    /// engine and a permit.
    pub fn new(
        pool_size: usize,
        cache_dir: impl Into<PathBuf>,
        model_name: impl Into<String>,
    ) -> Result<Arc<Self>, RagError> {
        if pool_size == 0 {
            return Err(RagError::Config(
                "reranker pool size must be greater than zero".into(),
            ));
        }
        let mut options = RerankInitOptions::default();
        options.cache_dir = cache_dir.into();
        fs::create_dir_all(&options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for n in 0..pool_size {
            debug!(engine = n, "creating rerank engine");
            let engine = TextRerank::try_new(options.clone())
                .map_err(|e| RagError::DependencyUnavailable(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(engine)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            model_name: model_name.into(),
        }))
    }
}

#[async_trait]
impl CrossEncoderModel for FastembedCrossEncoder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn score_pairs(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<f64>, RagError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| RagError::Cancelled)?;

        let engine = self.engines[pick_engine_index(self.engines.len())].clone();
        let mut guard = engine.lock().await;
        let results = guard
            .rerank(query.to_owned(), documents.to_vec(), false, None)
            .map_err(|e| RagError::DependencyUnavailable(e.to_string()))?;

        // Results come back ranked; restore input order by index.
        let mut scores = vec![0.0f64; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = f64::from(result.score);
            }
        }
        Ok(scores)
    }
}
