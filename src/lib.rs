pub mod archive;
pub mod cancel;
pub mod error;
pub mod export;
pub mod graph;
pub mod layer_config;
pub mod notifier;
pub mod squash;
pub mod squasher;
pub mod tag;
pub mod tar_extractor;
pub mod tree;
pub mod workdir;

// Re-exports for easy access
pub use cancel::Cancellation;
pub use error::{SquashError, SquashResult};
pub use export::{Export, HistoryEntry, Repositories, TagInfo};
pub use graph::{Layer, LayerGraph};
pub use layer_config::LayerConfig;
pub use notifier::Notifier;
pub use squasher::{SquashOptions, Squasher};
pub use tag::TagRef;
pub use workdir::WorkDir;
