// Translation of flash jobs into helper command lines

use std::path::PathBuf;

use super::staging::StagedArtifacts;
use crate::config::FlasherConfig;
use crate::executor::CommandLine;
use crate::models::{FlashJob, LkmSelection};

/// Locations baked into every command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPaths {
    pub ksud: PathBuf,
    pub magiskboot: Option<PathBuf>,
    pub boot_output_dir: Option<PathBuf>,
}

impl CommandPaths {
    pub fn new(ksud: impl Into<PathBuf>) -> Self {
        Self {
            ksud: ksud.into(),
            magiskboot: None,
            boot_output_dir: None,
        }
    }

    pub fn from_config(config: &FlasherConfig) -> Self {
        Self {
            ksud: config.executor.ksud_path.clone(),
            magiskboot: config.executor.magiskboot_path.clone(),
            boot_output_dir: Some(config.boot_output_dir()),
        }
    }

    fn helper(&self) -> CommandLine {
        CommandLine::new(&self.ksud)
    }

    fn with_magiskboot(&self, cmd: CommandLine) -> CommandLine {
        match &self.magiskboot {
            Some(path) => cmd
                .arg("--magiskboot")
                .arg(path.to_string_lossy().into_owned()),
            None => cmd,
        }
    }
}

fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Build the single command line for the job's current element.
///
/// File inputs are taken from `staged` when present so the helper reads the
/// cache copies rather than the caller's originals.
pub fn build_command(job: &FlashJob, staged: &StagedArtifacts, paths: &CommandPaths) -> CommandLine {
    match job {
        FlashJob::PatchBoot {
            source_image,
            lkm,
            target_is_ota_slot,
        } => {
            let mut cmd = paths.with_magiskboot(paths.helper().arg("boot-patch"));

            let image = staged.boot_image.as_ref().or(source_image.as_ref());
            cmd = match image {
                Some(image) => cmd.arg("-b").arg(path_arg(image)),
                None => cmd.arg("-f"),
            };

            if *target_is_ota_slot {
                cmd = cmd.arg("-u");
            }

            cmd = match lkm {
                LkmSelection::FromUri(original) => {
                    let lkm_path = staged.lkm.as_ref().unwrap_or(original);
                    cmd.arg("-m").arg(path_arg(lkm_path))
                }
                LkmSelection::KmiName(kmi) => cmd.arg("--kmi").arg(kmi.clone()),
                LkmSelection::None => cmd,
            };

            if let Some(out) = &paths.boot_output_dir {
                cmd = cmd.arg("-o").arg(path_arg(out));
            }
            cmd
        }
        FlashJob::InstallModule { .. }
        | FlashJob::UpdateModule { .. }
        | FlashJob::InstallModuleBatch { .. } => {
            let module = staged
                .module
                .clone()
                .or_else(|| job.current_artifact().cloned())
                .unwrap_or_default();
            paths
                .helper()
                .args(["module", "install"])
                .arg(path_arg(&module))
        }
        FlashJob::RestoreStock => paths.with_magiskboot(paths.helper().args(["boot-restore", "-f"])),
        FlashJob::UninstallPermanently => paths.with_magiskboot(paths.helper().arg("uninstall")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> CommandPaths {
        CommandPaths::new("/data/adb/ksud")
    }

    fn tail(job: &FlashJob, staged: &StagedArtifacts, paths: &CommandPaths) -> String {
        build_command(job, staged, paths).tail()
    }

    #[test]
    fn patch_boot_in_place() {
        let job = FlashJob::PatchBoot {
            source_image: None,
            lkm: LkmSelection::KmiName("android13-5.15".into()),
            target_is_ota_slot: true,
        };
        assert_eq!(
            tail(&job, &StagedArtifacts::default(), &paths()),
            "boot-patch -f -u --kmi android13-5.15"
        );
    }

    #[test]
    fn patch_boot_from_image_uses_staged_copies() {
        let job = FlashJob::PatchBoot {
            source_image: Some("/sdcard/boot.img".into()),
            lkm: LkmSelection::FromUri("/sdcard/my.ko".into()),
            target_is_ota_slot: false,
        };
        let staged = StagedArtifacts {
            boot_image: Some("/cache/boot.img".into()),
            lkm: Some("/cache/kernelsu-tmp-lkm.ko".into()),
            ..Default::default()
        };
        let mut paths = paths();
        paths.magiskboot = Some("/data/adb/magiskboot".into());
        paths.boot_output_dir = Some("/sdcard/Download".into());

        let cmd = build_command(&job, &staged, &paths);
        assert_eq!(cmd.program, PathBuf::from("/data/adb/ksud"));
        assert_eq!(
            cmd.tail(),
            "boot-patch --magiskboot /data/adb/magiskboot -b /cache/boot.img -m /cache/kernelsu-tmp-lkm.ko -o /sdcard/Download"
        );
    }

    #[test]
    fn module_variants_share_install_command() {
        let staged = StagedArtifacts::default();
        let single = FlashJob::InstallModule {
            artifact: "/sdcard/a.zip".into(),
        };
        let update = FlashJob::UpdateModule {
            artifact: "/sdcard/a.zip".into(),
        };
        let batch = FlashJob::InstallModuleBatch {
            artifacts: vec!["/sdcard/a.zip".into(), "/sdcard/b.zip".into()],
            current_index: 1,
        };

        assert_eq!(tail(&single, &staged, &paths()), "module install /sdcard/a.zip");
        assert_eq!(tail(&update, &staged, &paths()), "module install /sdcard/a.zip");
        assert_eq!(tail(&batch, &staged, &paths()), "module install /sdcard/b.zip");
    }

    #[test]
    fn restore_and_uninstall() {
        let staged = StagedArtifacts::default();
        assert_eq!(tail(&FlashJob::RestoreStock, &staged, &paths()), "boot-restore -f");
        assert_eq!(tail(&FlashJob::UninstallPermanently, &staged, &paths()), "uninstall");

        let mut with_mb = paths();
        with_mb.magiskboot = Some("/mb".into());
        assert_eq!(
            tail(&FlashJob::RestoreStock, &staged, &with_mb),
            "boot-restore -f --magiskboot /mb"
        );
    }
}
