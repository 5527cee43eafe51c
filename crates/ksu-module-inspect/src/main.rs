use anyhow::Result;
use clap::Parser;
use ksu_flasher::utils::manifest::{
    ArtifactInspector, ArtifactKind, FALLBACK_MODULE_NAME, ZipManifestInspector,
    read_module_prop_field,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// CLI tool to show what the flasher would make of local artifacts
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Module zips, boot images or kernel patch modules to inspect
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Print one JSON object per file instead of a table
    #[clap(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    path: PathBuf,
    kind: ArtifactKind,
    name: Option<String>,
    id: Option<String>,
    version: Option<String>,
}

fn inspect(inspector: &ZipManifestInspector, path: PathBuf) -> Report {
    let kind = inspector.classify(&path);
    let (name, id, version) = if kind == ArtifactKind::ModuleZip {
        let name = match inspector.module_name(&path) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("{:?}: {:#}", path, e);
                None
            }
        };
        let field = |key: &str| read_module_prop_field(&path, key).ok().flatten();
        (name, field("id"), field("version"))
    } else {
        (None, None, None)
    };

    Report {
        path,
        kind,
        name,
        id,
        version,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_writer(std::io::stderr)
        .init();

    let inspector = ZipManifestInspector;
    for path in args.files {
        info!("Inspecting {:?}", path);
        let report = inspect(&inspector, path);
        if args.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{}", report.path.display());
            println!("  kind:    {}", report.kind);
            if report.kind == ArtifactKind::ModuleZip {
                println!(
                    "  name:    {}",
                    report.name.as_deref().unwrap_or(FALLBACK_MODULE_NAME)
                );
                println!("  id:      {}", report.id.as_deref().unwrap_or("-"));
                println!("  version: {}", report.version.as_deref().unwrap_or("-"));
            }
        }
    }

    Ok(())
}
