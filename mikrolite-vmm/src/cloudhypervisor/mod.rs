//! The cloud-hypervisor-shaped provider (§4.5): no metadata service, so
//! cloud-init data is seeded through a FAT32 `CIDATA` disk image built via
//! an injected [`DiskPort`] instead of an MMDS endpoint.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mikrolite::ports::{DiskFile, DiskImageType, DiskPort, PortError, VmmProvider};
use mikrolite::{StateStore, Vm, ROOT_VOLUME_KEY};
use tracing::debug;

use crate::cmdline;
use crate::process;

const DEFAULT_CMDLINE: &str = "console=hvc0 root=/dev/vda rw reboot=k panic=1 ds=nocloud";
const CLOUD_INIT_IMAGE_SIZE: &str = "8Mb";

/// Errors assembling or spawning a cloud-hypervisor VM.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The VM's kernel mount wasn't resolved before `create` was called
    /// (an orchestrator invariant violation, not a user error).
    #[error("vm {0} has no resolved kernel mount")]
    MissingKernelMount(String),

    /// No root volume mount for a VM whose status should already carry one.
    #[error("vm {0} has no resolved root volume mount")]
    MissingRootMount(String),

    /// Failed to build the cloud-init seed disk.
    #[error("building cloud-init image for vm {vm}: {source}")]
    CloudInitImage {
        /// VM the image was being built for.
        vm: String,
        /// Underlying disk-port error.
        #[source]
        source: PortError,
    },

    /// Filesystem or process I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cloud-hypervisor VMM provider.
#[derive(Clone)]
pub struct CloudHypervisor {
    /// Path to the `cloud-hypervisor` binary.
    binary: String,
    /// State directory, shared with the orchestrator.
    state: StateStore,
    /// Builds the `CIDATA` seed disk from `vm.status.metadata`.
    disk: Arc<dyn DiskPort>,
}

impl std::fmt::Debug for CloudHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudHypervisor")
            .field("binary", &self.binary)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CloudHypervisor {
    /// Creates a provider that spawns `binary`, tracking state under
    /// `state`, building cloud-init seed disks through `disk`.
    #[must_use]
    pub fn new(binary: impl Into<String>, state: StateStore, disk: Arc<dyn DiskPort>) -> Self {
        Self { binary: binary.into(), state, disk }
    }

    async fn build_cloud_init_image(&self, vm: &Vm) -> Result<String, Error> {
        let path = self.state.socket_path(&vm.name, "cloud-init.img");
        let files: Vec<DiskFile> = vm
            .status
            .metadata
            .iter()
            .filter(|(key, _)| mikrolite_cloudinit::is_cloud_init_key(key))
            .map(|(key, value)| DiskFile {
                path: format!("/{key}"),
                content_base64: value.clone(),
            })
            .collect();

        self.disk
            .create(
                &path,
                CLOUD_INIT_IMAGE_SIZE,
                mikrolite_cloudinit::VOLUME_NAME,
                DiskImageType::Fat32,
                true,
                &files,
            )
            .await
            .map_err(|source| Error::CloudInitImage { vm: vm.name.clone(), source })?;

        Ok(path.display().to_string())
    }
}

#[async_trait]
impl VmmProvider for CloudHypervisor {
    async fn create(&self, vm: &Vm) -> Result<(), PortError> {
        let name = &vm.name;
        let kernel_mount = vm
            .status
            .kernel_mount
            .as_ref()
            .ok_or_else(|| Error::MissingKernelMount(name.clone()))?;
        let root_mount = vm
            .status
            .volume_mounts
            .get(ROOT_VOLUME_KEY)
            .ok_or_else(|| Error::MissingRootMount(name.clone()))?;

        let cloud_init_image = self.build_cloud_init_image(vm).await?;

        let kernel_cmdline = if vm.spec.kernel.cmdline.is_empty() {
            DEFAULT_CMDLINE.to_owned()
        } else {
            cmdline::format(&vm.spec.kernel.cmdline)
        };

        let mut disk_values = vec![root_mount.location.clone(), format!("{cloud_init_image},readonly=on")];
        for volume_name in vm.spec.additional_volumes.iter().map(|v| v.name.as_str()) {
            if let Some(mount) = vm.status.volume_mounts.get(volume_name) {
                disk_values.push(mount.location.clone());
            }
        }

        let net_values: Vec<String> = vm
            .spec
            .network
            .interfaces
            .values()
            .filter_map(|iface| {
                let status = vm.status.network_status.get(&iface.guest_device_name)?;
                Some(format!("tap={},mac={}", status.host_tap, status.guest_mac))
            })
            .collect();

        let socket_path = self.state.socket_path(name, "cloudhypervisor.sock");
        let mut args = vec![
            "--api-socket".to_owned(),
            socket_path.display().to_string(),
            "--log-file".to_owned(),
            self.state.log_path(name).display().to_string(),
            "-v".to_owned(),
            "--cmdline".to_owned(),
            kernel_cmdline,
            "--kernel".to_owned(),
            Path::new(&kernel_mount.location)
                .join(&vm.spec.kernel.filename)
                .display()
                .to_string(),
            "--cpus".to_owned(),
            format!("boot={}", vm.spec.vcpu),
            "--memory".to_owned(),
            format!("size={}M", vm.spec.memory_mib),
        ];
        args.push("--disk".to_owned());
        args.extend(disk_values.into_iter().map(|v| format!("path={v}")));
        if !net_values.is_empty() {
            args.push("--net".to_owned());
            args.extend(net_values);
        }

        debug!(vm = %name, binary = %self.binary, "spawning cloud-hypervisor");
        let pid = process::spawn_detached(&self.state, name, &self.binary, &args)
            .await
            .map_err(Error::Io)?;
        self.state.save_pid(name, pid)?;

        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), PortError> {
        process::signal(self.state.get_pid(name), libc::SIGHUP).map_err(Error::Io)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), PortError> {
        process::signal(self.state.get_pid(name), libc::SIGKILL).map_err(Error::Io)?;
        Ok(())
    }

    fn has_metadata_service(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mikrolite::{Kernel, KernelSource, Mount, MountKind, Network, VmSpec, Volume, VolumeSource};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn sample_vm() -> Vm {
        let mut vm = Vm::new(
            "demo",
            VmSpec {
                kernel: Kernel {
                    source: KernelSource::HostPath { path: "/boot/vmlinux".to_owned() },
                    filename: "vmlinux".to_owned(),
                    cmdline: BTreeMap::new(),
                },
                root_volume: Volume {
                    name: ROOT_VOLUME_KEY.to_owned(),
                    source: VolumeSource::Raw { path: "/tmp/root.img".to_owned() },
                },
                additional_volumes: Vec::new(),
                vcpu: 2,
                memory_mib: 1024,
                network: Network { bridge_name: "br0".to_owned(), interfaces: BTreeMap::new() },
                bootstrap: None,
            },
        );
        vm.status.kernel_mount = Some(Mount { kind: MountKind::FilesystemPath, location: "/var/lib/mikrolite/kernels/a".to_owned() });
        vm.status
            .volume_mounts
            .insert(ROOT_VOLUME_KEY.to_owned(), Mount { kind: MountKind::BlockDevice, location: "/dev/mapper/vm-demo-root".to_owned() });
        vm
    }

    #[tokio::test]
    async fn builds_cloud_init_image_under_state_dir() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let state = StateStore::open(dir.path()).expect("open");
        state.create_dir("demo").expect("create_dir");

        let provider = CloudHypervisor::new("cloud-hypervisor", state.clone(), Arc::new(mikrolite_disk::Disk));
        let vm = sample_vm();

        let image_path = provider.build_cloud_init_image(&vm).await.expect("build image");
        assert!(Path::new(&image_path).is_file());
    }

    #[test]
    fn default_cmdline_used_when_spec_cmdline_empty() {
        let vm = sample_vm();
        assert!(vm.spec.kernel.cmdline.is_empty());
        assert_eq!(DEFAULT_CMDLINE, "console=hvc0 root=/dev/vda rw reboot=k panic=1 ds=nocloud");
    }
}
