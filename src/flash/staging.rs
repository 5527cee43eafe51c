use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::FlashError;
use crate::models::{FlashJob, LkmSelection};

const BOOT_IMAGE_NAME: &str = "boot.img";
const LKM_NAME: &str = "kernelsu-tmp-lkm.ko";
const MODULE_NAME: &str = "module.zip";

/// Removes staged copies when dropped, whatever the job outcome
#[derive(Debug, Default)]
pub struct StagingGuard {
    files: Vec<PathBuf>,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        for file in &self.files {
            match std::fs::remove_file(file) {
                Ok(()) => debug!("Removed staged file {:?}", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staged file {:?}: {}", file, e),
            }
        }
    }
}

/// Cache copies of the inputs of one invocation
#[derive(Debug, Default)]
pub struct StagedArtifacts {
    pub boot_image: Option<PathBuf>,
    pub lkm: Option<PathBuf>,
    pub module: Option<PathBuf>,
    pub guard: StagingGuard,
}

/// Copies job inputs into the cache directory under fixed names
#[derive(Debug, Clone)]
pub struct ArtifactStager {
    cache_dir: PathBuf,
}

impl ArtifactStager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    async fn copy_in(
        &self,
        source: &Path,
        name: &str,
        guard: &mut StagingGuard,
    ) -> Result<PathBuf, FlashError> {
        let target = self.cache_dir.join(name);
        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| FlashError::Staging {
                path: source.to_path_buf(),
                source: e,
            })?;
        debug!("Staged {:?} as {:?}", source, target);
        guard.files.push(target.clone());
        Ok(target)
    }

    /// Stage whatever the job's current element reads from disk
    pub async fn stage(&self, job: &FlashJob) -> Result<StagedArtifacts, FlashError> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| FlashError::Staging {
                path: self.cache_dir.clone(),
                source: e,
            })?;

        // On error the guard drops and removes whatever was already copied
        let mut staged = StagedArtifacts::default();
        match job {
            FlashJob::PatchBoot {
                source_image, lkm, ..
            } => {
                if let Some(image) = source_image {
                    staged.boot_image =
                        Some(self.copy_in(image, BOOT_IMAGE_NAME, &mut staged.guard).await?);
                }
                if let LkmSelection::FromUri(lkm_path) = lkm {
                    staged.lkm = Some(self.copy_in(lkm_path, LKM_NAME, &mut staged.guard).await?);
                }
            }
            FlashJob::InstallModule { .. }
            | FlashJob::UpdateModule { .. }
            | FlashJob::InstallModuleBatch { .. } => {
                if let Some(artifact) = job.current_artifact() {
                    staged.module =
                        Some(self.copy_in(artifact, MODULE_NAME, &mut staged.guard).await?);
                }
            }
            FlashJob::RestoreStock | FlashJob::UninstallPermanently => {}
        }
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stages_module_and_cleans_up_on_drop() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let artifact = src.path().join("cool.zip");
        std::fs::write(&artifact, b"PK\x03\x04zip").unwrap();

        let stager = ArtifactStager::new(cache.path());
        let job = FlashJob::InstallModule {
            artifact: artifact.clone(),
        };
        let staged = stager.stage(&job).await.unwrap();

        let staged_module = staged.module.clone().unwrap();
        assert_eq!(staged_module, cache.path().join("module.zip"));
        assert_eq!(std::fs::read(&staged_module).unwrap(), b"PK\x03\x04zip");

        drop(staged);
        assert!(!staged_module.exists());
        assert!(artifact.exists(), "the original artifact is never touched");
    }

    #[tokio::test]
    async fn stages_boot_and_lkm() {
        let src = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let boot = src.path().join("boot.img");
        let lkm = src.path().join("android14.ko");
        std::fs::write(&boot, b"ANDROID!").unwrap();
        std::fs::write(&lkm, b"\x7fELF").unwrap();

        let staged = ArtifactStager::new(cache.path())
            .stage(&FlashJob::PatchBoot {
                source_image: Some(boot),
                lkm: LkmSelection::FromUri(lkm),
                target_is_ota_slot: false,
            })
            .await
            .unwrap();

        assert_eq!(staged.boot_image, Some(cache.path().join("boot.img")));
        assert_eq!(staged.lkm, Some(cache.path().join("kernelsu-tmp-lkm.ko")));
    }

    #[tokio::test]
    async fn missing_source_is_a_staging_error() {
        let cache = tempfile::tempdir().unwrap();
        let result = ArtifactStager::new(cache.path())
            .stage(&FlashJob::InstallModule {
                artifact: "/nonexistent/module.zip".into(),
            })
            .await;

        match result {
            Err(FlashError::Staging { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/module.zip"))
            }
            other => panic!("expected staging error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_to_stage_for_restore() {
        let cache = tempfile::tempdir().unwrap();
        let staged = ArtifactStager::new(cache.path())
            .stage(&FlashJob::RestoreStock)
            .await
            .unwrap();
        assert!(staged.boot_image.is_none() && staged.lkm.is_none() && staged.module.is_none());
    }
}
