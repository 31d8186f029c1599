//! CLI for the mikrolite microVM lifecycle controller.

#![allow(clippy::print_stdout, clippy::print_stderr, clippy::missing_docs_in_private_items)]

mod vm;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use mikrolite::ports::{DiskPort, ImagePort, NetworkPort, Snapshotter, VmmProvider};
use mikrolite::{Orchestrator, Snapshotters, StateStore};

const DEFAULT_STATE_PATH: &str = "/usr/local/share/mikrolite";

#[derive(Parser)]
#[command(name = "mikrolite", version, about = "Host-side microVM lifecycle controller")]
struct Cli {
    /// Path to the container runtime socket, accepted for external-interface
    /// compatibility. The image port here pulls directly from a registry,
    /// so this flag is currently unused by any port.
    #[allow(dead_code)]
    #[arg(long, global = true)]
    socket_path: Option<String>,

    /// Root directory for per-VM state, image blobs, and leases.
    #[arg(long, global = true, default_value = DEFAULT_STATE_PATH)]
    state_path: PathBuf,

    /// Enable debug-level logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Which VMM to drive.
    #[arg(long, global = true, value_enum, default_value_t = Provider::Firecracker)]
    provider: Provider,

    /// Path to the `firecracker` binary.
    #[arg(long, global = true, default_value = "firecracker")]
    firecracker_bin: String,

    /// Path to the `cloud-hypervisor` binary.
    #[arg(long, global = true, default_value = "cloud-hypervisor")]
    cloudhypervisor_bin: String,

    #[command(subcommand)]
    command: Command,
}

/// Selectable VMM backend (§6).
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Provider {
    /// `firecracker`: exposes MMDS.
    Firecracker,
    /// `cloud-hypervisor`: seeds cloud-init through a FAT32 disk image.
    Cloudhypervisor,
}

#[derive(Subcommand)]
enum Command {
    /// Manage microVMs.
    Vm {
        #[command(subcommand)]
        action: vm::VmAction,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(e) = run(cli).await {
        if let Some(err) = e.downcast_ref::<mikrolite::Error>() {
            if err.is_already_exists() {
                eprintln!("mikrolite: {err}");
                return;
            }
        }
        eprintln!("mikrolite: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let action = match cli.command {
        Command::Vm { action } => action,
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "mikrolite", &mut std::io::stdout());
            return Ok(());
        }
    };

    let state = StateStore::open(&cli.state_path)?;

    let image: Arc<dyn ImagePort> = Arc::new(mikrolite_oci::Oci::open(cli.state_path.join("oci"))?);
    let network: Arc<dyn NetworkPort> = Arc::new(mikrolite_net::Net::connect()?);
    let disk: Arc<dyn DiskPort> = Arc::new(mikrolite_disk::Disk);
    let provider: Arc<dyn VmmProvider> = match cli.provider {
        Provider::Firecracker => Arc::new(mikrolite_vmm::Firecracker::new(cli.firecracker_bin, state.clone())),
        Provider::Cloudhypervisor => Arc::new(mikrolite_vmm::CloudHypervisor::new(
            cli.cloudhypervisor_bin,
            state.clone(),
            Arc::clone(&disk),
        )),
    };

    let snapshotters = vm::snapshotters_for(&action);
    let orchestrator = Orchestrator::new(image, network, disk, provider, state, snapshotters);

    vm::dispatch(&orchestrator, action).await
}
