pub mod builder;
pub mod index;
pub mod line_store;
pub mod snapshot;

pub use builder::{BuildOptions, BuildReport, IndexBuilder};
pub use index::VectorIndex;
pub use line_store::{LineStore, MetadataStore, SearchTextStore};
pub use snapshot::{LoadOptions, LoadedSnapshot, Manifest};
