//! The firecracker-shaped provider (§4.5): exposes a metadata service,
//! so the create pipeline adds the MMDS interface and, when the VM has
//! cloud-init metadata, a `metadata.json` file plus a rewritten kernel
//! cmdline pointing the guest datasource at it.

use std::path::Path;

use async_trait::async_trait;
use mikrolite::ports::{PortError, VmmProvider};
use mikrolite::{Mount, StateStore, Vm, ROOT_VOLUME_KEY};
use serde::Serialize;
use tracing::debug;

use crate::cmdline;
use crate::process;

const DS_NOCLOUD_NET: &str = "nocloud-net;s=http://169.254.169.254/latest/";

/// Errors assembling or spawning a firecracker VM.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The VM's kernel mount wasn't resolved before `create` was called
    /// (an orchestrator invariant violation, not a user error).
    #[error("vm {0} has no resolved kernel mount")]
    MissingKernelMount(String),

    /// Filesystem or process I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failed to serialize the config or metadata JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Firecracker VMM provider.
#[derive(Debug, Clone)]
pub struct Firecracker {
    /// Path to the `firecracker` binary.
    binary: String,
    /// State directory, shared with the orchestrator.
    state: StateStore,
}

impl Firecracker {
    /// Creates a provider that spawns `binary`, tracking state under `state`.
    #[must_use]
    pub fn new(binary: impl Into<String>, state: StateStore) -> Self {
        Self { binary: binary.into(), state }
    }
}

#[async_trait]
impl VmmProvider for Firecracker {
    async fn create(&self, vm: &Vm) -> Result<(), PortError> {
        let name = &vm.name;
        let kernel_mount = vm
            .status
            .kernel_mount
            .as_ref()
            .ok_or_else(|| Error::MissingKernelMount(name.clone()))?;

        let mut cmdline = vm.spec.kernel.cmdline.clone();
        let metadata_path = if vm.status.metadata.is_empty() {
            None
        } else {
            let path = self.state.metadata_json_path(name);
            write_metadata_json(&path, &vm.status.metadata)?;
            cmdline.insert("ds".to_owned(), DS_NOCLOUD_NET.to_owned());
            if let Some(network_config) =
                vm.status.metadata.get(mikrolite_cloudinit::NETWORK_CONFIG_DATA_KEY)
            {
                cmdline.insert(
                    mikrolite_cloudinit::NETWORK_CONFIG_DATA_KEY.to_owned(),
                    network_config.clone(),
                );
            }
            Some(path)
        };

        let drives: Vec<Drive> = vm
            .status
            .volume_mounts
            .iter()
            .map(|(volume_name, mount)| Drive {
                drive_id: volume_name.clone(),
                path_on_host: mount.location.clone(),
                is_root_device: volume_name == ROOT_VOLUME_KEY,
                is_read_only: false,
            })
            .collect();

        let network_interfaces: Vec<NetworkInterface> = vm
            .spec
            .network
            .interfaces
            .values()
            .filter_map(|iface| {
                let status = vm.status.network_status.get(&iface.guest_device_name)?;
                Some(NetworkInterface {
                    iface_id: iface.guest_device_name.clone(),
                    host_dev_name: status.host_tap.clone(),
                    guest_mac: status.guest_mac.clone(),
                    allow_mmds_requests: iface.allow_metadata_requests,
                })
            })
            .collect();

        let mmds_config = {
            let mmds_ifaces: Vec<String> = network_interfaces
                .iter()
                .filter(|i| i.allow_mmds_requests)
                .map(|i| i.iface_id.clone())
                .collect();
            (!mmds_ifaces.is_empty()).then(|| MmdsConfig {
                version: "V1".to_owned(),
                network_interfaces: mmds_ifaces,
            })
        };

        let socket_path = self.state.socket_path(name, "firecracker.sock");
        let config = Config {
            vmid: name.clone(),
            socket_path: socket_path.display().to_string(),
            kernel_image_path: kernel_image_path(kernel_mount, &vm.spec.kernel.filename),
            kernel_args: cmdline::format(&cmdline),
            machine_cfg: MachineCfg {
                vcpu: vm.spec.vcpu,
                mem_mib: vm.spec.memory_mib,
                smt: true,
            },
            drives,
            network_interfaces,
            mmds_config,
            log_path: self.state.log_path(name).display().to_string(),
            log_level: "Debug".to_owned(),
        };

        let config_path = self.state.socket_path(name, "firecracker-config.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

        let mut args = vec![
            "--api-sock".to_owned(),
            socket_path.display().to_string(),
            "--config-file".to_owned(),
            config_path.display().to_string(),
        ];
        if let Some(path) = &metadata_path {
            args.push("--metadata".to_owned());
            args.push(path.display().to_string());
        }

        debug!(vm = %name, binary = %self.binary, "spawning firecracker");
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
        true
    }
}

fn kernel_image_path(mount: &Mount, filename: &str) -> String {
    Path::new(&mount.location).join(filename).display().to_string()
}

fn write_metadata_json(
    path: &Path,
    metadata: &std::collections::BTreeMap<String, String>,
) -> Result<(), Error> {
    use base64::Engine as _;

    let mut decoded = serde_json::Map::new();
    for (key, value) in metadata {
        if key == mikrolite_cloudinit::NETWORK_CONFIG_DATA_KEY {
            continue;
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value)
            .unwrap_or_else(|_| value.clone().into_bytes());
        let text = String::from_utf8_lossy(&bytes).into_owned();
        decoded.insert(key.clone(), serde_json::Value::String(text));
    }
    std::fs::write(path, serde_json::to_vec_pretty(&decoded)?)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct Config {
    vmid: String,
    socket_path: String,
    kernel_image_path: String,
    kernel_args: String,
    machine_cfg: MachineCfg,
    drives: Vec<Drive>,
    network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mmds_config: Option<MmdsConfig>,
    log_path: String,
    log_level: String,
}

#[derive(Debug, Serialize)]
struct MachineCfg {
    vcpu: u32,
    mem_mib: u32,
    smt: bool,
}

#[derive(Debug, Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface {
    iface_id: String,
    host_dev_name: String,
    guest_mac: String,
    allow_mmds_requests: bool,
}

#[derive(Debug, Serialize)]
struct MmdsConfig {
    version: String,
    network_interfaces: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_image_path_joins_mount_and_filename() {
        let mount = Mount {
            kind: mikrolite::MountKind::FilesystemPath,
            location: "/var/lib/mikrolite/kernels/abcd".to_owned(),
        };
        assert_eq!(
            kernel_image_path(&mount, "vmlinux"),
            "/var/lib/mikrolite/kernels/abcd/vmlinux"
        );
    }
}
