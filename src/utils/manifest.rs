// Best-effort inspection of local artifacts
//
// Nothing here is a gate: names fall back to a placeholder and the
// classification is only used to warn about suspicious input.

use anyhow::{Context, Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::debug;

/// Entry inside a module zip that carries its metadata
pub const MODULE_PROP: &str = "module.prop";

/// Display label used whenever a module name cannot be determined
pub const FALLBACK_MODULE_NAME: &str = "Module";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const BOOT_IMAGE_MAGIC: &[u8] = b"ANDROID!";
const KPM_KEYWORDS: [&str; 4] = ["name=", "version=", "license=", "author="];
const MIN_KPM_KEYWORDS: usize = 2;
const MIN_STRING_LEN: usize = 4;
// Kernel patch modules are small; don't scan arbitrarily large inputs
const MAX_SNIFF_BYTES: u64 = 16 * 1024 * 1024;

static UNSAFE_NAME_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^a-zA-Z0-9\s\-_.@()\x{4e00}-\x{9fa5}]").expect("static regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArtifactKind {
    ModuleZip,
    BootImage,
    KernelPatch,
    Unknown,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::ModuleZip => write!(f, "module zip"),
            ArtifactKind::BootImage => write!(f, "boot image"),
            ArtifactKind::KernelPatch => write!(f, "kernel patch module"),
            ArtifactKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Replaceable content sniffing used by the orchestrator
pub trait ArtifactInspector: Send + Sync {
    /// Declared display name of a module artifact
    fn module_name(&self, path: &Path) -> Result<String>;

    fn classify(&self, path: &Path) -> ArtifactKind;
}

/// Default inspector reading `module.prop` out of zip containers
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipManifestInspector;

impl ArtifactInspector for ZipManifestInspector {
    fn module_name(&self, path: &Path) -> Result<String> {
        let raw = read_module_prop_field(path, "name")?
            .ok_or_else(|| anyhow!("{} has no name field", MODULE_PROP))?;
        let name = sanitize_module_name(&raw);
        if name.is_empty() {
            return Err(anyhow!("Module name {:?} is empty after sanitizing", raw));
        }
        Ok(name)
    }

    fn classify(&self, path: &Path) -> ArtifactKind {
        match classify_file(path) {
            Ok(kind) => kind,
            Err(e) => {
                debug!("Could not classify {:?}: {}", path, e);
                ArtifactKind::Unknown
            }
        }
    }
}

/// Strip characters that do not belong in a display name
pub fn sanitize_module_name(raw: &str) -> String {
    UNSAFE_NAME_CHARS.replace_all(raw, "").trim().to_string()
}

/// Look up `key=` in the zip's `module.prop`; the rest of the file is ignored
pub fn read_module_prop_field(path: &Path, key: &str) -> Result<Option<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut archive =
        zip::ZipArchive::new(file).with_context(|| format!("{:?} is not a zip archive", path))?;
    let entry = archive
        .by_name(MODULE_PROP)
        .with_context(|| format!("{:?} has no {}", path, MODULE_PROP))?;

    let prefix = format!("{}=", key);
    for line in BufReader::new(entry).lines() {
        let line = line.with_context(|| format!("Failed to read {}", MODULE_PROP))?;
        if let Some(value) = line.strip_prefix(&prefix) {
            return Ok(Some(value.to_string()));
        }
    }
    Ok(None)
}

fn classify_file(path: &Path) -> Result<ArtifactKind> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 8];
    let read = read_up_to(&mut file, &mut head)?;
    let head = &head[..read];

    if head.starts_with(ZIP_MAGIC) {
        return Ok(ArtifactKind::ModuleZip);
    }
    if head.starts_with(BOOT_IMAGE_MAGIC) {
        return Ok(ArtifactKind::BootImage);
    }

    let mut content = head.to_vec();
    file.take(MAX_SNIFF_BYTES).read_to_end(&mut content)?;
    if count_kpm_keywords(&content) >= MIN_KPM_KEYWORDS {
        Ok(ArtifactKind::KernelPatch)
    } else {
        Ok(ArtifactKind::Unknown)
    }
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Count printable strings (as `strings(1)` would list them) that start with
/// one of the kernel patch metadata keys
fn count_kpm_keywords(content: &[u8]) -> usize {
    content
        .split(|b| !(b.is_ascii_graphic() || *b == b' ' || *b == b'\t'))
        .filter(|run| run.len() >= MIN_STRING_LEN)
        .filter(|run| {
            KPM_KEYWORDS
                .iter()
                .any(|keyword| run.starts_with(keyword.as_bytes()))
        })
        .count()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Write;
    use std::path::{Path, PathBuf};

    /// Write a module zip with the given `module.prop` body
    pub fn module_zip(dir: &Path, file_name: &str, prop: &str) -> PathBuf {
        let path = dir.join(file_name);
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        zip.start_file("module.prop", options).unwrap();
        zip.write_all(prop.as_bytes()).unwrap();
        zip.start_file("customize.sh", options).unwrap();
        zip.write_all(b"ui_print hello\n").unwrap();
        zip.finish().unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::module_zip;
    use super::*;

    #[test]
    fn reads_name_from_module_prop() {
        let dir = tempfile::tempdir().unwrap();
        let path = module_zip(
            dir.path(),
            "zygisk.zip",
            "id=zygisk_next\nname=Zygisk Next!\nversion=1.2\n",
        );

        let name = ZipManifestInspector.module_name(&path).unwrap();
        assert_eq!(name, "Zygisk Next");
        assert_eq!(
            read_module_prop_field(&path, "id").unwrap().as_deref(),
            Some("zygisk_next")
        );
    }

    #[test]
    fn missing_name_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let no_name = module_zip(dir.path(), "a.zip", "id=a\nversion=1\n");
        assert!(ZipManifestInspector.module_name(&no_name).is_err());

        let not_zip = dir.path().join("b.zip");
        std::fs::write(&not_zip, b"definitely not a zip").unwrap();
        assert!(ZipManifestInspector.module_name(&not_zip).is_err());
    }

    #[test]
    fn sanitize_keeps_cjk_and_punctuation() {
        assert_eq!(sanitize_module_name("  模块 (beta)-1.0 ★ "), "模块 (beta)-1.0");
        assert_eq!(sanitize_module_name("$$$"), "");
    }

    #[test]
    fn classifies_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let zip = module_zip(dir.path(), "m.zip", "name=m\n");

        let boot = dir.path().join("boot.img");
        std::fs::write(&boot, b"ANDROID!\0\0\0\0rest-of-header").unwrap();

        let kpm = dir.path().join("hook.kpm");
        let mut kpm_bytes = b"\x7fELF\x02\x01\x01\0\0\0".to_vec();
        kpm_bytes.extend_from_slice(b"name=hook\0version=0.1\0author=me\0");
        std::fs::write(&kpm, kpm_bytes).unwrap();

        let junk = dir.path().join("junk.bin");
        std::fs::write(&junk, b"\x00\x01\x02name=only-one\x00").unwrap();

        assert_eq!(ZipManifestInspector.classify(&zip), ArtifactKind::ModuleZip);
        assert_eq!(ZipManifestInspector.classify(&boot), ArtifactKind::BootImage);
        assert_eq!(ZipManifestInspector.classify(&kpm), ArtifactKind::KernelPatch);
        assert_eq!(ZipManifestInspector.classify(&junk), ArtifactKind::Unknown);
        assert_eq!(
            ZipManifestInspector.classify(&dir.path().join("missing")),
            ArtifactKind::Unknown
        );
    }
}
