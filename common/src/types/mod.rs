pub mod checkpoint;
pub mod chunk;
pub mod citation;
pub mod document;
pub mod graph;
pub mod manifest;
pub mod query;

pub use checkpoint::Checkpoint;
pub use chunk::Chunk;
pub use citation::{Citation, ValidityWindow};
pub use document::Document;
pub use graph::{GraphEdge, GraphNode, Provenance};
pub use manifest::ChunkManifest;
pub use query::{
    FrameType, GroundedAnswer, HybridQuery, QueryFilters, SourceEvent, StreamFrame, TimeWindow,
};
