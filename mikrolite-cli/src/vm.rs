//! `vm create`/`vm remove`/`vm list` (§6).

use std::collections::BTreeMap;

use anyhow::Result;
use mikrolite::ports::Snapshotter;
use mikrolite::{
    Bootstrap, CancellationToken, Interface, Kernel, KernelSource, Network, Orchestrator,
    Snapshotters, StaticIpv4, Vm, VmSpec, Volume, VolumeSource,
};

const DEFAULT_KERNEL_FILENAME: &str = "vmlinux";
const DEFAULT_BRIDGE: &str = "mikrolite";
const PRIMARY_GUEST_DEVICE: &str = "eth0";

/// `vm` subcommands.
#[derive(clap::Subcommand)]
pub enum VmAction {
    /// Creates and starts a new microVM.
    Create(Box<CreateArgs>),

    /// Stops and removes a microVM's state, network, and hypervisor process.
    Remove {
        /// Name of the VM to remove.
        name: String,
    },

    /// Lists every VM recorded under the state root.
    List,
}

/// Arguments for `vm create`.
#[derive(clap::Args)]
pub struct CreateArgs {
    /// Name to assign the VM.
    #[arg(long)]
    name: String,

    /// OCI image reference for the root filesystem.
    #[arg(long = "root-image")]
    root_image: String,

    /// OCI image reference containing the kernel. Mutually exclusive with
    /// `--kernel-path`.
    #[arg(long = "kernel-image", conflicts_with = "kernel_path", required_unless_present = "kernel_path")]
    kernel_image: Option<String>,

    /// Host filesystem path to an already-present kernel. Mutually
    /// exclusive with `--kernel-image`.
    #[arg(long = "kernel-path", conflicts_with = "kernel_image")]
    kernel_path: Option<String>,

    /// Kernel image filename, relative to the resolved kernel mount.
    #[arg(long = "kernel-filename", default_value = DEFAULT_KERNEL_FILENAME)]
    kernel_filename: String,

    /// Number of virtual CPUs.
    #[arg(long = "cpu", default_value_t = 1)]
    cpu: u32,

    /// Memory size in MiB.
    #[arg(long = "memory", default_value_t = 512)]
    memory: u32,

    /// Host bridge every attached TAP enslaves to.
    #[arg(long = "network-bridge", default_value = DEFAULT_BRIDGE)]
    network_bridge: String,

    /// Static IPv4 address (CIDR) for the primary interface. Absent means
    /// the guest DHCPs.
    #[arg(long = "static-ip")]
    static_ip: Option<String>,

    /// Static IPv4 gateway (CIDR), used only alongside `--static-ip`.
    #[arg(long = "static-gateway-ip")]
    static_gateway_ip: Option<String>,

    /// Path to an SSH public key file to seed into the guest via cloud-init.
    #[arg(long = "ssh-key")]
    ssh_key: Option<String>,

    /// Snapshotter used when the root volume is a container image.
    #[arg(long = "snapshotter-volume", default_value = "native")]
    snapshotter_volume: Snapshotter,

    /// Snapshotter used when the kernel source is a container image.
    #[arg(long = "snapshotter-kernel", default_value = "native")]
    snapshotter_kernel: Snapshotter,
}

impl CreateArgs {
    fn into_spec(self) -> VmSpec {
        let kernel_source = match (self.kernel_image, self.kernel_path) {
            (Some(image), None) => KernelSource::Container { image },
            (None, Some(path)) => KernelSource::HostPath { path },
            _ => unreachable!("clap enforces exactly one of kernel-image/kernel-path"),
        };

        let static_ipv4 = self.static_ip.map(|address| StaticIpv4 {
            address,
            gateway: self.static_gateway_ip,
            nameservers: None,
        });

        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            PRIMARY_GUEST_DEVICE.to_owned(),
            Interface {
                guest_device_name: PRIMARY_GUEST_DEVICE.to_owned(),
                allow_metadata_requests: false,
                attach_to_bridge: true,
                static_ipv4,
            },
        );

        VmSpec {
            kernel: Kernel {
                source: kernel_source,
                filename: self.kernel_filename,
                cmdline: BTreeMap::new(),
            },
            root_volume: Volume {
                name: mikrolite::ROOT_VOLUME_KEY.to_owned(),
                source: VolumeSource::Container { image: self.root_image },
            },
            additional_volumes: Vec::new(),
            vcpu: self.cpu,
            memory_mib: self.memory,
            network: Network { bridge_name: self.network_bridge, interfaces },
            bootstrap: self.ssh_key.map(|ssh_key_path| Bootstrap { ssh_key_path: Some(ssh_key_path) }),
        }
    }
}

/// Picks the snapshotter pair a `vm create` invocation requested; unused by
/// `remove`/`list`, which get the default (irrelevant since neither
/// resolves a container-sourced kernel or volume).
#[must_use]
pub fn snapshotters_for(action: &VmAction) -> Snapshotters {
    match action {
        VmAction::Create(args) => Snapshotters { kernel: args.snapshotter_kernel, volume: args.snapshotter_volume },
        VmAction::Remove { .. } | VmAction::List => {
            Snapshotters { kernel: Snapshotter::Native, volume: Snapshotter::Native }
        }
    }
}

/// Runs the `vm` subcommand chosen on the command line.
pub async fn dispatch(orchestrator: &Orchestrator, action: VmAction) -> Result<()> {
    match action {
        VmAction::Create(args) => create(orchestrator, *args).await,
        VmAction::Remove { name } => remove(orchestrator, &name).await,
        VmAction::List => list(orchestrator),
    }
}

async fn create(orchestrator: &Orchestrator, args: CreateArgs) -> Result<()> {
    let name = args.name.clone();
    let spec = args.into_spec();
    let vm = orchestrator.create(&name, spec, &CancellationToken::new()).await?;
    println!("{}", vm.name);
    Ok(())
}

async fn remove(orchestrator: &Orchestrator, name: &str) -> Result<()> {
    orchestrator.remove(name).await?;
    println!("{name}");
    Ok(())
}

fn list(orchestrator: &Orchestrator) -> Result<()> {
    let vms: Vec<Vm> = orchestrator.list()?;
    println!("{}", serde_json::to_string_pretty(&vms)?);
    Ok(())
}
