use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Kernel module input for a boot-image patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum LkmSelection {
    /// A local `.ko` file to embed
    FromUri(PathBuf),
    /// Let the helper pick the LKM matching this KMI
    KmiName(String),
    None,
}

/// What to run against the privileged helper.
///
/// Jobs are immutable; a batch advances by producing a new value through
/// [`FlashJob::advance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum FlashJob {
    PatchBoot {
        source_image: Option<PathBuf>,
        lkm: LkmSelection,
        target_is_ota_slot: bool,
    },
    InstallModule {
        artifact: PathBuf,
    },
    InstallModuleBatch {
        artifacts: Vec<PathBuf>,
        current_index: usize,
    },
    UpdateModule {
        artifact: PathBuf,
    },
    RestoreStock,
    UninstallPermanently,
}

impl FlashJob {
    /// Start a batch at its first element
    pub fn batch(artifacts: Vec<PathBuf>) -> Self {
        FlashJob::InstallModuleBatch {
            artifacts,
            current_index: 0,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, FlashJob::InstallModuleBatch { .. })
    }

    /// Empty batches and batches whose index ran past the end have nothing to run
    pub fn is_exhausted(&self) -> bool {
        match self {
            FlashJob::InstallModuleBatch {
                artifacts,
                current_index,
            } => artifacts.is_empty() || *current_index >= artifacts.len(),
            _ => false,
        }
    }

    /// The artifact the next invocation operates on, if the job has one
    pub fn current_artifact(&self) -> Option<&PathBuf> {
        match self {
            FlashJob::PatchBoot { source_image, .. } => source_image.as_ref(),
            FlashJob::InstallModule { artifact } | FlashJob::UpdateModule { artifact } => {
                Some(artifact)
            }
            FlashJob::InstallModuleBatch {
                artifacts,
                current_index,
            } => artifacts.get(*current_index),
            FlashJob::RestoreStock | FlashJob::UninstallPermanently => None,
        }
    }

    /// The batch continuation, or `None` when this was the last element
    /// (or the job is not a batch).
    pub fn advance(&self) -> Option<FlashJob> {
        match self {
            FlashJob::InstallModuleBatch {
                artifacts,
                current_index,
            } if current_index + 1 < artifacts.len() => Some(FlashJob::InstallModuleBatch {
                artifacts: artifacts.clone(),
                current_index: current_index + 1,
            }),
            _ => None,
        }
    }

    /// Whether a successful run only takes effect after a reboot.
    ///
    /// Patching with an explicit source image writes a new image file
    /// instead of touching the device, so only the in-place variant counts.
    pub fn needs_reboot(&self) -> bool {
        match self {
            FlashJob::PatchBoot { source_image, .. } => source_image.is_none(),
            FlashJob::RestoreStock | FlashJob::UninstallPermanently => true,
            FlashJob::InstallModule { .. }
            | FlashJob::InstallModuleBatch { .. }
            | FlashJob::UpdateModule { .. } => false,
        }
    }
}

impl fmt::Display for FlashJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashJob::PatchBoot { source_image, .. } => match source_image {
                Some(path) => write!(f, "patch boot image {}", path.display()),
                None => write!(f, "patch boot (direct install)"),
            },
            FlashJob::InstallModule { artifact } => {
                write!(f, "install module {}", artifact.display())
            }
            FlashJob::InstallModuleBatch {
                artifacts,
                current_index,
            } => write!(
                f,
                "install module batch [{}/{}]",
                current_index + 1,
                artifacts.len()
            ),
            FlashJob::UpdateModule { artifact } => {
                write!(f, "update module {}", artifact.display())
            }
            FlashJob::RestoreStock => write!(f, "restore stock boot image"),
            FlashJob::UninstallPermanently => write!(f, "uninstall permanently"),
        }
    }
}

/// Outcome of a single executor invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashResult {
    pub success: bool,
    pub exit_code: i32,
    pub needs_reboot: bool,
}

impl FlashResult {
    pub fn from_exit_code(exit_code: i32, needs_reboot: bool) -> Self {
        Self {
            success: exit_code == 0,
            exit_code,
            needs_reboot,
        }
    }

    /// Failure that happened before anything ran; the exit code is indeterminate
    pub fn not_started() -> Self {
        Self {
            success: false,
            exit_code: 0,
            needs_reboot: false,
        }
    }

    /// Reboot prompt only makes sense once the job actually succeeded
    pub fn should_offer_reboot(&self) -> bool {
        self.success && self.needs_reboot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashingStatus {
    Flashing,
    Success,
    Failed,
}

impl fmt::Display for FlashingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashingStatus::Flashing => write!(f, "Flashing"),
            FlashingStatus::Success => write!(f, "Flash success"),
            FlashingStatus::Failed => write!(f, "Flash failed"),
        }
    }
}

// A simple cancel token for leaving a batch between elements
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(n: usize) -> FlashJob {
        FlashJob::batch((0..n).map(|i| PathBuf::from(format!("/tmp/m{i}.zip"))).collect())
    }

    #[test]
    fn advance_produces_new_value_and_stops_at_last_element() {
        let first = batch_of(2);
        let second = first.advance().unwrap();

        assert_eq!(
            first,
            batch_of(2),
            "advancing must not mutate the original batch"
        );
        match &second {
            FlashJob::InstallModuleBatch { current_index, .. } => assert_eq!(*current_index, 1),
            other => panic!("unexpected job {other:?}"),
        }
        assert!(second.advance().is_none());
    }

    #[test]
    fn exhausted_batches() {
        assert!(FlashJob::batch(vec![]).is_exhausted());
        let over = FlashJob::InstallModuleBatch {
            artifacts: vec![PathBuf::from("a.zip")],
            current_index: 1,
        };
        assert!(over.is_exhausted());
        assert!(over.current_artifact().is_none());
        assert!(!batch_of(1).is_exhausted());
        assert!(!FlashJob::RestoreStock.is_exhausted());
    }

    #[test]
    fn reboot_requirements() {
        let direct = FlashJob::PatchBoot {
            source_image: None,
            lkm: LkmSelection::None,
            target_is_ota_slot: false,
        };
        let to_file = FlashJob::PatchBoot {
            source_image: Some(PathBuf::from("boot.img")),
            lkm: LkmSelection::KmiName("android14-6.1".into()),
            target_is_ota_slot: false,
        };
        assert!(direct.needs_reboot());
        assert!(!to_file.needs_reboot());
        assert!(FlashJob::RestoreStock.needs_reboot());
        assert!(FlashJob::UninstallPermanently.needs_reboot());
        assert!(!batch_of(3).needs_reboot());
        assert!(
            !FlashJob::InstallModule {
                artifact: "m.zip".into()
            }
            .needs_reboot()
        );
    }

    #[test]
    fn batch_position_survives_serialization() {
        let job = batch_of(3).advance().unwrap();
        let json = serde_json::to_string(&job).unwrap();
        let back: FlashJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }

    #[test]
    fn reboot_offer_requires_success() {
        assert!(FlashResult::from_exit_code(0, true).should_offer_reboot());
        assert!(!FlashResult::from_exit_code(1, true).should_offer_reboot());
        assert!(!FlashResult::not_started().success);
    }
}
