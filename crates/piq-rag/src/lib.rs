pub mod chunker;
pub mod hybrid;
pub mod ingest;
pub mod lexical;
pub mod store;

pub use chunker::{ChunkerConfig, TextChunker};
pub use hybrid::{fuse_results, HybridConfig, HybridSearch, Retriever};
pub use ingest::{DocumentIngestor, IngestConfig, IngestReport};
pub use lexical::{LexicalConfig, LexicalIndex};
pub use store::{
    cosine_similarity, ContentStore, MemoryContentStore, DEFAULT_EMBEDDING_DIMENSION,
};

pub use piq_error::{PiqError, Result};
