//! The VM aggregate: spec, status, and their constituent value types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The status key under which the root volume's mount is recorded, used
/// only in provider-side argv assembly; the `status.volume_mounts` map
/// itself is keyed by the volume's declared name.
pub const ROOT_VOLUME_KEY: &str = "root";

/// Aggregate of a VM's identity, declared spec, and runtime status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Identifier and state-directory suffix. Not the guest hostname.
    pub name: String,
    /// Declarative specification.
    pub spec: VmSpec,
    /// Runtime status, populated as the create pipeline progresses.
    #[serde(default)]
    pub status: VmStatus,
}

impl Vm {
    /// Creates a fresh `Vm` with empty status, ready to be fed through
    /// the create pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: VmSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            status: VmStatus::default(),
        }
    }
}

/// Declarative specification of a microVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    /// Kernel to boot.
    pub kernel: Kernel,
    /// Root filesystem volume.
    pub root_volume: Volume,
    /// Additional volumes, in declaration order (`vol0`, `vol1`, ...).
    #[serde(default)]
    pub additional_volumes: Vec<Volume>,
    /// Number of virtual CPUs.
    pub vcpu: u32,
    /// Memory size in MiB.
    pub memory_mib: u32,
    /// Network topology.
    pub network: Network,
    /// Optional cloud-init bootstrap data.
    #[serde(default)]
    pub bootstrap: Option<Bootstrap>,
}

/// Kernel source and boot parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    /// Where to obtain the kernel image from.
    pub source: KernelSource,
    /// Kernel image filename (relative to the resolved mount).
    pub filename: String,
    /// Kernel command-line arguments. Empty means "use the provider's
    /// default" (§4.5).
    #[serde(default)]
    pub cmdline: BTreeMap<String, String>,
}

/// Source of a kernel image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum KernelSource {
    /// Already present on the host filesystem.
    HostPath {
        /// Path to the kernel image file.
        path: String,
    },
    /// Pulled from an OCI container image.
    Container {
        /// Image reference.
        image: String,
    },
}

/// A volume attached to the VM, either root or additional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Declared name. The root volume's name is always `"root"`.
    pub name: String,
    /// Where the volume's content comes from.
    pub source: VolumeSource,
}

/// Source of a volume's filesystem content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum VolumeSource {
    /// A raw filesystem image already present on the host.
    Raw {
        /// Path to the raw image file.
        path: String,
    },
    /// Pulled from an OCI container image.
    Container {
        /// Image reference.
        image: String,
    },
}

/// Network topology for a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Name of the pre-existing host bridge every attached TAP enslaves to.
    pub bridge_name: String,
    /// Declared interfaces, keyed by guest device name.
    pub interfaces: BTreeMap<String, Interface>,
}

/// A single declared network interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Device name as it will appear inside the guest.
    pub guest_device_name: String,
    /// Whether the guest may reach the VMM's metadata service over this NIC.
    #[serde(default)]
    pub allow_metadata_requests: bool,
    /// Whether the host TAP should be enslaved to `network.bridge_name`.
    #[serde(default = "default_true")]
    pub attach_to_bridge: bool,
    /// Static IPv4 configuration. Absent means the guest DHCPs.
    #[serde(default)]
    pub static_ipv4: Option<StaticIpv4>,
}

const fn default_true() -> bool {
    true
}

/// Static IPv4 configuration for an [`Interface`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticIpv4 {
    /// Address in CIDR form, e.g. `10.0.0.5/24`.
    pub address: String,
    /// Gateway address in CIDR form, e.g. `10.0.0.1/24`.
    #[serde(default)]
    pub gateway: Option<String>,
    /// Nameserver addresses.
    #[serde(default)]
    pub nameservers: Option<Vec<String>>,
}

/// Cloud-init bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Path to an SSH public key file to seed into the guest.
    #[serde(default)]
    pub ssh_key_path: Option<String>,
}

/// Runtime status accumulated as the create pipeline progresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmStatus {
    /// Resolved mounts, keyed by the volume's declared name.
    #[serde(default)]
    pub volume_mounts: BTreeMap<String, Mount>,
    /// Resolved kernel mount.
    #[serde(default)]
    pub kernel_mount: Option<Mount>,
    /// Network namespace the VM runs in (unused when empty, reserved for
    /// a future namespaced-networking mode).
    #[serde(default)]
    pub network_namespace: String,
    /// Per-interface network state, keyed by guest device name.
    #[serde(default)]
    pub network_status: BTreeMap<String, NetStatus>,
    /// Free-form metadata, including the base64-encoded cloud-init
    /// documents under `meta-data`/`user-data`/`network-config`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// The guest's resolved IPv4 address.
    #[serde(default)]
    pub ip: String,
}

/// Per-interface network state recorded once the TAP has been created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NetStatus {
    /// Name of the host-side TAP device.
    pub host_tap: String,
    /// MAC address generated for the guest side of this interface.
    pub guest_mac: String,
}

/// A resolved mount location for a kernel or volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Kind of mount.
    pub kind: MountKind,
    /// Filesystem path or block device path, depending on `kind`.
    pub location: String,
}

/// Kind of a resolved [`Mount`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MountKind {
    /// A directory on the host filesystem.
    FilesystemPath,
    /// A host block device.
    BlockDevice,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_json_round_trips() {
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
        let spec = VmSpec {
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
                bridge_name: "mikrolite".to_owned(),
                interfaces,
            },
            bootstrap: None,
        };
        let vm = Vm::new("vm1", spec);

        let json = serde_json::to_string_pretty(&vm).expect("serialize");
        let round_tripped: Vm = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(round_tripped.name, vm.name);
        assert_eq!(round_tripped.spec.vcpu, vm.spec.vcpu);
        assert_eq!(
            round_tripped.spec.network.interfaces.len(),
            vm.spec.network.interfaces.len()
        );
    }
}
