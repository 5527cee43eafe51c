pub mod checksum;
pub mod elevation;
pub mod manifest;
pub mod tracker;

pub use elevation::*;
pub use manifest::{ArtifactInspector, ArtifactKind, ZipManifestInspector};
pub use tracker::{InstallStatus, InstallStatusTracker};
