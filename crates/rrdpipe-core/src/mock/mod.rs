//! In-memory test doubles for the filesystem and the archive tool.

mod archive;
mod filesystem;

pub use archive::MockArchiveTool;
pub use filesystem::MockFs;
