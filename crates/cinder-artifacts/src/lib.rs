//! Content-addressed artifact storage for Cinder CI.

pub mod compression;
pub mod digest;
pub mod filesystem;
pub mod memory;
pub mod retention;

pub use compression::{Compression, compress, decompress};
pub use digest::content_digest;
pub use filesystem::FilesystemArtifactStore;
pub use memory::MemoryArtifactStore;
pub use retention::RetentionIndex;
