// Flash job execution: command mapping, artifact staging, output handling
// and the orchestrator that ties them to the privileged executor.

pub mod command;
pub mod orchestrator;
pub mod output;
pub mod staging;

pub use command::{CommandPaths, build_command};
pub use orchestrator::{FlashEvent, FlashListener, FlashOrchestrator, NoopListener};
pub use output::{CLEAR_SCREEN, OutputLog};
pub use staging::{ArtifactStager, StagedArtifacts};
