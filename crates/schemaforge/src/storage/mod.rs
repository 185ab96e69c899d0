pub mod filesystem;

pub use filesystem::{is_within, ArtifactStore};
