use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use ksu_flasher::download::{DownloadEvent, DownloadMonitor, DownloadRequest, HttpTransferBackend};
use ksu_flasher::executor::PrivilegedExecutor;
use ksu_flasher::flash::{FlashListener, FlashOrchestrator};
use ksu_flasher::models::CancelToken;
use ksu_flasher::utils::checksum;
use ksu_flasher::{FlashJob, FlashResult, FlasherConfig, LkmSelection, logging};

/// Flash boot images and install modules through the KernelSU helper
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (default: per-user flasher.toml)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the helper binary path
    #[clap(long, global = true)]
    ksud: Option<PathBuf>,

    /// Pass this magiskboot binary to the helper
    #[clap(long, global = true)]
    magiskboot: Option<PathBuf>,

    /// Save the install log to the log directory afterwards
    #[clap(long, global = true)]
    save_log: bool,

    /// Diagnostic log level, overridden by RUST_LOG
    #[clap(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write diagnostic logs to a daily file in this directory
    #[clap(long, global = true)]
    log_dir: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Patch a boot image, or the device boot partition when no image is given
    PatchBoot {
        /// Boot image to patch; the result is written to the boot output directory
        #[clap(short = 'b', long)]
        image: Option<PathBuf>,

        /// Kernel module to embed
        #[clap(short = 'm', long, conflicts_with = "kmi")]
        lkm: Option<PathBuf>,

        /// KMI whose bundled module should be used
        #[clap(long)]
        kmi: Option<String>,

        /// Install into the inactive slot after an OTA
        #[clap(short = 'u', long)]
        ota: bool,
    },
    /// Install one or more module zips, in the given order
    Install {
        #[clap(required = true)]
        modules: Vec<PathBuf>,
    },
    /// Update an installed module from a newer zip
    Update { module: PathBuf },
    /// Restore the stock boot image
    Restore,
    /// Remove KernelSU from the device permanently
    Uninstall,
    /// Fetch a remote artifact, optionally installing it as a module
    Download {
        url: String,

        /// File name in the download directory (default: last URL segment)
        #[clap(short, long)]
        file_name: Option<String>,

        /// Expected SHA-256 of the file
        #[clap(long)]
        sha256: Option<String>,

        /// Install the downloaded file as a module
        #[clap(long)]
        install: bool,
    },
}

/// Prints helper output as it arrives
struct ConsoleListener;

impl FlashListener for ConsoleListener {
    fn on_stdout(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    fn on_stderr(&self, line: &str) {
        debug!("helper: {}", line);
    }
}

fn load_config(args: &Args) -> Result<FlasherConfig> {
    let mut config = match &args.config {
        Some(path) => FlasherConfig::load_from(path)?,
        None => FlasherConfig::load()?,
    };
    if let Some(ksud) = &args.ksud {
        config.executor.ksud_path = ksud.clone();
    }
    if let Some(magiskboot) = &args.magiskboot {
        config.executor.magiskboot_path = Some(magiskboot.clone());
    }
    Ok(config)
}

fn file_name_from_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid URL {}", url))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Cannot derive a file name from {}, pass --file-name", url))
}

/// A file that is already on disk with the expected digest needs no fetch
async fn verified_copy(path: PathBuf, sha256: &str) -> Option<PathBuf> {
    if !path.exists() {
        return None;
    }
    let expected = sha256.to_string();
    let candidate = path.clone();
    match tokio::task::spawn_blocking(move || checksum::verify_file(&candidate, &expected)).await {
        Ok(Ok(())) => Some(path),
        Ok(Err(e)) => {
            info!("Existing {:?} does not match ({}), downloading again", path, e);
            None
        }
        Err(e) => {
            warn!("Checksum task failed: {}", e);
            None
        }
    }
}

async fn download(config: &FlasherConfig, url: &str, file_name: String, sha256: Option<String>) -> Result<PathBuf> {
    if let Some(expected) = &sha256 {
        let existing = config.download_dir().join(&file_name);
        if let Some(path) = verified_copy(existing, expected).await {
            info!("{} already downloaded and verified", file_name);
            return Ok(path);
        }
    }

    let backend = Arc::new(HttpTransferBackend::new(&config.download.user_agent)?);
    let (monitor, mut events) =
        DownloadMonitor::new(backend, config.download.clone(), config.download_dir());

    let mut request = DownloadRequest::new(url, file_name);
    if let Some(sha256) = sha256 {
        request = request.with_sha256(sha256);
    }
    let key = request.key();
    monitor.download(request);

    while let Some(event) = events.recv().await {
        if event.key() != &key {
            continue;
        }
        match event {
            DownloadEvent::Downloaded { path, .. } => return Ok(path),
            DownloadEvent::Downloading { .. } => info!("{} is already downloading", key.file_name),
            DownloadEvent::Error { error, .. } => return Err(error.into()),
        }
    }
    Err(anyhow!("Download monitor stopped unexpectedly"))
}

fn report(job: &FlashJob, result: &FlashResult, orchestrator: &FlashOrchestrator) {
    if job.is_batch() {
        let status = orchestrator.tracker().snapshot();
        if status.has_failures() {
            println!();
            println!(
                "{} of {} modules failed to install:",
                status.failed_modules.len(),
                status.total_modules
            );
            for name in &status.failed_modules {
                println!("  - {}", name);
            }
        }
    } else if !result.success {
        if result.exit_code != 0 {
            println!("Error code: {}.", result.exit_code);
        }
        println!("Please check the log.");
    }

    if result.should_offer_reboot() {
        println!("Reboot the device to apply the changes.");
    }
}

async fn run(args: Args) -> Result<bool> {
    let config = load_config(&args)?;

    let job = match args.command {
        Command::PatchBoot {
            image,
            lkm,
            kmi,
            ota,
        } => FlashJob::PatchBoot {
            source_image: image,
            lkm: match (lkm, kmi) {
                (Some(path), _) => LkmSelection::FromUri(path),
                (None, Some(kmi)) => LkmSelection::KmiName(kmi),
                (None, None) => LkmSelection::None,
            },
            target_is_ota_slot: ota,
        },
        Command::Install { mut modules } => {
            if modules.len() == 1 {
                FlashJob::InstallModule {
                    artifact: modules.remove(0),
                }
            } else {
                FlashJob::batch(modules)
            }
        }
        Command::Update { module } => FlashJob::UpdateModule { artifact: module },
        Command::Restore => FlashJob::RestoreStock,
        Command::Uninstall => FlashJob::UninstallPermanently,
        Command::Download {
            url,
            file_name,
            sha256,
            install,
        } => {
            let file_name = match file_name {
                Some(name) => name,
                None => file_name_from_url(&url)?,
            };
            let path = download(&config, &url, file_name, sha256).await?;
            println!("Downloaded to {}", path.display());
            if !install {
                return Ok(true);
            }
            FlashJob::InstallModule { artifact: path }
        }
    };

    let executor = Arc::new(PrivilegedExecutor::new(config.executor.su_path.clone()));
    let orchestrator = FlashOrchestrator::new(executor, &config);

    // Ctrl-C stops a batch between modules; a running helper is never interrupted
    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current module");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator
        .run_until_cancelled(job.clone(), &ConsoleListener, &cancel)
        .await;
    report(&job, &result, &orchestrator);

    if args.save_log {
        let path = orchestrator.save_log(&config.log_dir(), &config.flash.product_name)?;
        println!("Log saved to {}", path.display());
    }

    let all_ok = if job.is_batch() {
        !orchestrator.tracker().snapshot().has_failures() && !cancel.is_cancelled()
    } else {
        result.success
    };
    Ok(all_ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(&args.log_level, args.log_dir.as_deref()) {
        eprintln!("{:#}", e);
    }

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
