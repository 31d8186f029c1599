//! The create and remove pipelines (§4.1).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::domain::{
    Interface, Kernel, KernelSource, Mount, MountKind, NetStatus, Vm, VmSpec, VolumeSource,
};
use crate::error::{Error, Result};
use crate::ports::{DiskPort, ImagePort, NetworkPort, Snapshotter, VmmProvider};
use crate::state::{owner_of, StateStore};

/// Maximum number of neighbor-table polling attempts during IP discovery
/// (§4.1 stage 8, §5).
const IP_DISCOVERY_ATTEMPTS: u32 = 40;
/// Delay between neighbor-table polling attempts.
const IP_DISCOVERY_INTERVAL: Duration = Duration::from_millis(500);
/// Host TAP name prefix for ordinary interfaces.
const TAP_PREFIX: &str = "mlt";
/// Host TAP name prefix for the synthetic metadata-service interface.
const TAP_PREFIX_MMDS: &str = "mltm";
/// Guest device name treated as the VM's primary interface for IP
/// discovery (§4.1 stage 8).
const PRIMARY_GUEST_DEVICE: &str = "eth0";
/// Synthetic interface injected when the provider exposes a metadata
/// service (§4.1 stage 2).
const MMDS_GUEST_DEVICE: &str = "eth1";
/// Snapshotter `image_id` used for the kernel.
const KERNEL_IMAGE_ID: &str = "kernel";
/// Snapshotter `image_id` used for the root volume.
const ROOT_IMAGE_ID: &str = "root";

/// Snapshotter choice for kernel and volume resolution, set once per
/// [`Orchestrator`] (CLI flags `--snapshotter-kernel`/`--snapshotter-volume`).
#[derive(Debug, Clone, Copy)]
pub struct Snapshotters {
    /// Snapshotter used when the kernel source is a container image.
    pub kernel: Snapshotter,
    /// Snapshotter used for volumes sourced from container images.
    pub volume: Snapshotter,
}

/// Drives the ordered create pipeline and its symmetric remove pipeline
/// (§4.1) against a set of pluggable collaborators.
pub struct Orchestrator {
    image: Arc<dyn ImagePort>,
    network: Arc<dyn NetworkPort>,
    disk: Arc<dyn DiskPort>,
    provider: Arc<dyn VmmProvider>,
    state: StateStore,
    snapshotters: Snapshotters,
}

impl Orchestrator {
    /// Assembles an orchestrator from its collaborators.
    #[must_use]
    pub fn new(
        image: Arc<dyn ImagePort>,
        network: Arc<dyn NetworkPort>,
        disk: Arc<dyn DiskPort>,
        provider: Arc<dyn VmmProvider>,
        state: StateStore,
        snapshotters: Snapshotters,
    ) -> Self {
        Self {
            image,
            network,
            disk,
            provider,
            state,
            snapshotters,
        }
    }

    /// Runs the create pipeline (§4.1) for `name`/`spec`. Does not roll
    /// back on failure: partial state accumulated on disk and in the
    /// kernel remains, to be cleaned up by [`Self::remove`] (§4.1,
    /// "Failure policy").
    pub async fn create(
        &self,
        name: &str,
        spec: VmSpec,
        cancel: &CancellationToken,
    ) -> Result<Vm> {
        debug!(vm = name, "creating vm");

        // Stage 1: validate.
        if name.is_empty() {
            return Err(Error::InvalidInput("vm name must not be empty".to_owned()));
        }
        if self.state.exists(name) {
            return Err(Error::AlreadyExists {
                name: name.to_owned(),
            });
        }
        self.state.create_dir(name)?;

        let mut vm = Vm::new(name, spec);
        let owner = owner_of(name);

        // Stage 2: augment for metadata service.
        if self.provider.has_metadata_service() {
            debug!(vm = name, "augmenting spec with mmds interface");
            vm.spec.network.interfaces.insert(
                MMDS_GUEST_DEVICE.to_owned(),
                Interface {
                    guest_device_name: MMDS_GUEST_DEVICE.to_owned(),
                    allow_metadata_requests: true,
                    attach_to_bridge: false,
                    static_ipv4: Some(crate::domain::StaticIpv4 {
                        address: "169.254.169.200/16".to_owned(),
                        gateway: None,
                        nameservers: None,
                    }),
                },
            );
        }

        check_cancelled(cancel)?;

        // Stage 3: resolve kernel.
        debug!(vm = name, "resolving kernel");
        vm.status.kernel_mount = Some(self.resolve_kernel(&owner, &vm.spec.kernel).await?);

        check_cancelled(cancel)?;

        // Stage 4: resolve volumes.
        debug!(vm = name, "resolving volumes");
        vm.status.volume_mounts.insert(
            vm.spec.root_volume.name.clone(),
            self.resolve_volume(&owner, ROOT_IMAGE_ID, &vm.spec.root_volume.source)
                .await?,
        );
        for (i, volume) in vm.spec.additional_volumes.iter().enumerate() {
            let image_id = format!("vol{i}");
            let mount = self
                .resolve_volume(&owner, &image_id, &volume.source)
                .await?;
            vm.status.volume_mounts.insert(volume.name.clone(), mount);
        }

        check_cancelled(cancel)?;

        // Stage 5: network setup.
        debug!(vm = name, "setting up network");
        self.setup_network(&mut vm, cancel).await?;

        check_cancelled(cancel)?;

        // Stage 6: render cloud-init.
        debug!(vm = name, "rendering cloud-init documents");
        self.render_cloud_init(&mut vm);

        check_cancelled(cancel)?;

        // Stage 7: provider create + start.
        debug!(vm = name, "starting vmm");
        self.provider
            .create(&vm)
            .await
            .map_err(|e| Error::provider(name, e))?;

        // Stage 8: discover IP.
        debug!(vm = name, "waiting for guest ip");
        vm.status.ip = self.discover_ip(&vm, cancel).await?;

        // Stage 9: persist.
        self.state.save(&vm)?;
        info!(vm = name, ip = %vm.status.ip, "vm created");

        Ok(vm)
    }

    /// Resolves the kernel mount: a host path is used directly; a
    /// container image is pulled and mounted under `(owner, "kernel")`.
    async fn resolve_kernel(&self, owner: &str, kernel: &Kernel) -> Result<Mount> {
        match &kernel.source {
            KernelSource::HostPath { path } => Ok(Mount {
                kind: MountKind::FilesystemPath,
                location: path.clone(),
            }),
            KernelSource::Container { image } => self
                .image
                .pull_and_mount(owner, image, KERNEL_IMAGE_ID, self.snapshotters.kernel)
                .await
                .map_err(|e| Error::image(format!("{owner}/{KERNEL_IMAGE_ID}"), e)),
        }
    }

    /// Resolves a single volume's mount.
    async fn resolve_volume(
        &self,
        owner: &str,
        image_id: &str,
        source: &VolumeSource,
    ) -> Result<Mount> {
        match source {
            VolumeSource::Raw { path } => Ok(Mount {
                kind: MountKind::FilesystemPath,
                location: path.clone(),
            }),
            VolumeSource::Container { image } => self
                .image
                .pull_and_mount(owner, image, image_id, self.snapshotters.volume)
                .await
                .map_err(|e| Error::image(format!("{owner}/{image_id}"), e)),
        }
    }

    /// Stage 5: allocates TAPs, generates MACs, attaches to the bridge.
    /// Iterates interfaces sorted by guest device name for determinism
    /// (§9, "Open questions").
    async fn setup_network(&self, vm: &mut Vm, cancel: &CancellationToken) -> Result<()> {
        let bridge = vm.spec.network.bridge_name.clone();
        if !self
            .network
            .bridge_exists(&bridge)
            .await
            .map_err(|e| Error::network(bridge.as_str(), e))?
        {
            return Err(Error::BridgeMissing { bridge });
        }

        // `interfaces` is a `BTreeMap`, so this already iterates sorted by
        // guest device name (§9, "Open questions").
        let interfaces: Vec<Interface> = vm.spec.network.interfaces.values().cloned().collect();

        let mut network_status = BTreeMap::new();
        for iface in &interfaces {
            check_cancelled(cancel)?;

            let mac = crate::mac::generate();
            let prefix = if iface.guest_device_name == MMDS_GUEST_DEVICE {
                TAP_PREFIX_MMDS
            } else {
                TAP_PREFIX
            };
            let tap_name = self
                .network
                .new_interface_name(prefix)
                .await
                .map_err(|e| Error::network(prefix, e))?;

            self.network
                .interface_create(&tap_name, &mac)
                .await
                .map_err(|e| Error::network(tap_name.as_str(), e))?;

            if iface.attach_to_bridge {
                self.network
                    .attach_to_bridge(&tap_name, &bridge)
                    .await
                    .map_err(|e| Error::network(tap_name.as_str(), e))?;
            }

            network_status.insert(
                iface.guest_device_name.clone(),
                NetStatus {
                    host_tap: tap_name,
                    guest_mac: mac,
                },
            );
        }

        vm.status.network_status = network_status;
        Ok(())
    }

    /// Stage 6: produces the three cloud-init documents (§4.6).
    fn render_cloud_init(&self, vm: &mut Vm) {
        let mut interfaces: Vec<_> = vm.spec.network.interfaces.values().cloned().collect();
        interfaces.sort_by(|a, b| a.guest_device_name.cmp(&b.guest_device_name));

        let cloudinit_interfaces: Vec<mikrolite_cloudinit::NetworkInterface> = interfaces
            .iter()
            .filter_map(|iface| {
                let status = vm.status.network_status.get(&iface.guest_device_name)?;
                Some(mikrolite_cloudinit::NetworkInterface {
                    guest_device_name: iface.guest_device_name.clone(),
                    mac: status.guest_mac.clone(),
                    static_ipv4: iface.static_ipv4.as_ref().map(|s| {
                        mikrolite_cloudinit::StaticIpv4 {
                            address: s.address.clone(),
                            gateway: s.gateway.clone(),
                            nameservers: s.nameservers.clone(),
                        }
                    }),
                })
            })
            .collect();

        vm.status.metadata.insert(
            mikrolite_cloudinit::NETWORK_CONFIG_DATA_KEY.to_owned(),
            mikrolite_cloudinit::encode_network_config(&cloudinit_interfaces),
        );
        vm.status.metadata.insert(
            mikrolite_cloudinit::INSTANCE_DATA_KEY.to_owned(),
            mikrolite_cloudinit::encode_meta_data(&vm.name),
        );

        if let Some(bootstrap) = &vm.spec.bootstrap {
            let ssh_authorized_key = bootstrap
                .ssh_key_path
                .as_deref()
                .and_then(|path| std::fs::read_to_string(path).ok())
                .map(|s| s.trim().to_owned());
            vm.status.metadata.insert(
                mikrolite_cloudinit::USER_DATA_KEY.to_owned(),
                mikrolite_cloudinit::encode_user_data(&mikrolite_cloudinit::UserData {
                    hostname: vm.name.clone(),
                    ssh_authorized_key,
                }),
            );
        }
    }

    /// Stage 8: polls the neighbor table for the primary interface's MAC,
    /// at most [`IP_DISCOVERY_ATTEMPTS`] times.
    async fn discover_ip(&self, vm: &Vm, cancel: &CancellationToken) -> Result<String> {
        let Some(primary) = vm.status.network_status.get(PRIMARY_GUEST_DEVICE) else {
            return Err(Error::IpNotFound {
                vm: vm.name.clone(),
                attempts: 0,
            });
        };

        for _ in 0..IP_DISCOVERY_ATTEMPTS {
            check_cancelled(cancel)?;

            let ip = self
                .network
                .get_ip_from_mac(&primary.guest_mac)
                .await
                .map_err(|e| Error::network(primary.guest_mac.as_str(), e))?;
            if !ip.is_empty() {
                return Ok(ip);
            }

            tokio::select! {
                () = tokio::time::sleep(IP_DISCOVERY_INTERVAL) => {}
                () = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        Err(Error::IpNotFound {
            vm: vm.name.clone(),
            attempts: IP_DISCOVERY_ATTEMPTS,
        })
    }

    /// Runs the remove pipeline (§4.1). Every step tolerates the VM (or
    /// its resources) already being gone; only genuinely unexpected errors
    /// abort.
    pub async fn remove(&self, name: &str) -> Result<()> {
        debug!(vm = name, "removing vm");

        if let Err(e) = self.provider.stop(name).await {
            warn!(vm = name, error = %e, "provider stop failed, continuing");
        }
        if let Err(e) = self.provider.delete(name).await {
            warn!(vm = name, error = %e, "provider delete failed, continuing");
        }

        let owner = owner_of(name);
        if let Err(e) = self.image.cleanup(&owner).await {
            warn!(vm = name, error = %e, "image cleanup failed, continuing");
        }

        // Best-effort: remove TAPs recorded in vm.json. A half-created VM
        // with no vm.json leaves any stray TAP behind; accepted per the
        // "no rollback" policy (§4.1, §9).
        if let Ok(vm) = self.state.load(name) {
            for status in vm.status.network_status.values() {
                if let Err(e) = self.network.interface_delete(&status.host_tap).await {
                    warn!(vm = name, tap = status.host_tap, error = %e, "tap delete failed, continuing");
                }
            }
        }

        self.state.remove_dir(name)?;
        info!(vm = name, "vm removed");
        Ok(())
    }

    /// Lists every VM recorded in the state store.
    pub fn list(&self) -> Result<Vec<Vm>> {
        self.state.list()
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDisk, MockImage, MockNetwork, MockProvider};
    use crate::domain::{Kernel, Network, StaticIpv4, Volume};
    use std::collections::BTreeMap;

    fn orchestrator(
        state_root: &std::path::Path,
        has_mmds: bool,
        bridges: &[&str],
    ) -> (Orchestrator, Arc<MockNetwork>, Arc<MockProvider>) {
        let image = Arc::new(MockImage::default());
        let network = Arc::new(MockNetwork::with_bridges(bridges));
        let disk = Arc::new(MockDisk::default());
        let provider = Arc::new(MockProvider::new(has_mmds));
        let state = StateStore::open(state_root).expect("open state store");
        let orch = Orchestrator::new(
            image,
            network.clone(),
            disk,
            provider.clone(),
            state,
            Snapshotters {
                kernel: Snapshotter::Native,
                volume: Snapshotter::Native,
            },
        );
        (orch, network, provider)
    }

    fn spec_with_bridge(bridge: &str) -> VmSpec {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "eth0".to_owned(),
            Interface {
                guest_device_name: "eth0".to_owned(),
                allow_metadata_requests: false,
                attach_to_bridge: true,
                static_ipv4: None,
            },
        );
        VmSpec {
            kernel: Kernel {
                source: KernelSource::HostPath {
                    path: "/boot/vmlinux".to_owned(),
                },
                filename: "vmlinux".to_owned(),
                cmdline: BTreeMap::new(),
            },
            root_volume: Volume {
                name: "root".to_owned(),
                source: VolumeSource::Container {
                    image: "docker.io/example/rootfs:latest".to_owned(),
                },
            },
            additional_volumes: Vec::new(),
            vcpu: 2,
            memory_mib: 2048,
            network: Network {
                bridge_name: bridge.to_owned(),
                interfaces,
            },
            bootstrap: None,
        }
    }

    #[tokio::test]
    async fn create_then_list_round_trips_s1() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, network, _provider) = orchestrator(dir.path(), false, &["mikrolite"]);
        network.set_neighbor_ip("eth0-mac-placeholder", "10.0.0.42");
        // Primary MAC is generated randomly; have the mock resolve any MAC.
        network.resolve_all_to("10.0.0.42");

        let spec = spec_with_bridge("mikrolite");
        let vm = orch
            .create("vm1", spec, &CancellationToken::new())
            .await
            .expect("create succeeds");

        assert_eq!(vm.status.ip, "10.0.0.42");
        assert_eq!(vm.status.network_status.len(), 1);
        let tap = &vm.status.network_status["eth0"].host_tap;
        assert_eq!(tap, "mlt0");

        let listed = orch.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "vm1");
        assert_eq!(listed[0].spec.vcpu, vm.spec.vcpu);
    }

    #[tokio::test]
    async fn duplicate_create_returns_already_exists_s3() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, network, _provider) = orchestrator(dir.path(), false, &["mikrolite"]);
        network.resolve_all_to("10.0.0.42");

        orch.create("vm1", spec_with_bridge("mikrolite"), &CancellationToken::new())
            .await
            .expect("first create succeeds");

        let err = orch
            .create("vm1", spec_with_bridge("mikrolite"), &CancellationToken::new())
            .await
            .expect_err("second create fails");
        assert!(err.is_already_exists());
        assert_eq!(network.tap_count(), 1, "no second tap allocated");
    }

    #[tokio::test]
    async fn missing_bridge_fails_before_any_tap_s2() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, network, _provider) = orchestrator(dir.path(), false, &[]);

        let err = orch
            .create("vm1", spec_with_bridge("mikrolite"), &CancellationToken::new())
            .await
            .expect_err("create fails");
        assert!(matches!(err, Error::BridgeMissing { .. }));
        assert_eq!(network.tap_count(), 0);
    }

    #[tokio::test]
    async fn remove_then_recreate_succeeds_s3() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, network, _provider) = orchestrator(dir.path(), false, &["mikrolite"]);
        network.resolve_all_to("10.0.0.42");

        orch.create("vm1", spec_with_bridge("mikrolite"), &CancellationToken::new())
            .await
            .expect("create succeeds");

        orch.remove("vm1").await.expect("remove succeeds");
        assert!(!dir.path().join("vm1").exists());

        orch.create("vm1", spec_with_bridge("mikrolite"), &CancellationToken::new())
            .await
            .expect("recreate succeeds");
    }

    #[tokio::test]
    async fn remove_on_never_created_name_is_a_no_op_s5() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, _network, _provider) = orchestrator(dir.path(), false, &["mikrolite"]);
        orch.remove("never-created").await.expect("remove is a no-op");
    }

    #[tokio::test]
    async fn mmds_provider_adds_synthetic_interface_and_metadata() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, network, _provider) = orchestrator(dir.path(), true, &["mikrolite"]);
        network.resolve_all_to("10.0.0.42");

        let vm = orch
            .create("vm1", spec_with_bridge("mikrolite"), &CancellationToken::new())
            .await
            .expect("create succeeds");

        assert_eq!(vm.status.network_status.len(), 2, "eth0 + synthetic eth1");
        assert!(vm.status.network_status.contains_key("eth1"));
        assert_eq!(vm.status.network_status["eth1"].host_tap, "mltm0");

        assert!(vm.status.metadata.contains_key("meta-data"));
        assert!(vm.status.metadata.contains_key("network-config"));
        assert!(!vm.status.metadata.contains_key("user-data"));
    }

    #[tokio::test]
    async fn bootstrap_seeds_user_data_s4() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, network, _provider) = orchestrator(dir.path(), false, &["mikrolite"]);
        network.resolve_all_to("10.0.0.42");

        let key_file = tempfile::NamedTempFile::new().expect("tmp file");
        std::fs::write(key_file.path(), "ssh-ed25519 AAAA... user@host\n").expect("write key");

        let mut spec = spec_with_bridge("mikrolite");
        spec.bootstrap = Some(crate::domain::Bootstrap {
            ssh_key_path: Some(key_file.path().display().to_string()),
        });

        let vm = orch
            .create("vm1", spec, &CancellationToken::new())
            .await
            .expect("create succeeds");

        let encoded = &vm.status.metadata["user-data"];
        let decoded = {
            use base64::Engine as _;
            String::from_utf8(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .expect("valid base64"),
            )
            .expect("utf8")
        };
        assert!(decoded.contains("ssh-ed25519 AAAA... user@host"));
    }

    #[tokio::test]
    async fn static_ipv4_interface_s6() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let (orch, network, _provider) = orchestrator(dir.path(), false, &["mikrolite"]);
        network.resolve_all_to("10.0.0.5");

        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "eth0".to_owned(),
            Interface {
                guest_device_name: "eth0".to_owned(),
                allow_metadata_requests: false,
                attach_to_bridge: true,
                static_ipv4: Some(StaticIpv4 {
                    address: "10.0.0.5/24".to_owned(),
                    gateway: Some("10.0.0.1/24".to_owned()),
                    nameservers: None,
                }),
            },
        );
        let mut spec = spec_with_bridge("mikrolite");
        spec.network.interfaces = interfaces;

        let vm = orch
            .create("vm1", spec, &CancellationToken::new())
            .await
            .expect("create succeeds");

        let encoded = &vm.status.metadata["network-config"];
        use base64::Engine as _;
        let decoded = String::from_utf8(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .expect("valid base64"),
        )
        .expect("utf8");
        assert!(decoded.contains("dhcp4: false"));
        assert!(decoded.contains("10.0.0.5/24"));
        assert!(decoded.contains("gateway4: 10.0.0.1"));
    }
}
