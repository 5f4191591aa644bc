pub mod chunker;
pub mod embedder;
pub mod graph_sink;
pub mod normalizer;
pub mod text_sink;
pub mod worker;

pub use chunker::Chunker;
pub use embedder::Embedder;
pub use graph_sink::{
    ConflictResolution, EntityExtractor, EntityMention, GraphReport, GraphSink, RelationExtractor,
    RelationMention,
};
pub use normalizer::Normalizer;
pub use text_sink::{SinkReport, TextSink};
pub use worker::{IngestionWorker, SyncReport, ToolClient};
