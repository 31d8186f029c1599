//! Pluggable collaborator traits the orchestrator drives (§4.2–§4.5, §9).
//!
//! Each port is a capability trait with a mock implementation for the test
//! suite (see `crate::testing`) and a real implementation in its own crate
//! (`mikrolite-oci`, `mikrolite-net`, `mikrolite-disk`, `mikrolite-vmm`).
//! No runtime plugin loading is needed: callers pick a concrete type.

use std::error::Error as StdError;
use std::path::Path;

use async_trait::async_trait;

use crate::domain::{Mount, Vm};

/// Boxed error type ports use so their crates don't need to agree on one
/// concrete error representation.
pub type PortError = Box<dyn StdError + Send + Sync>;

/// Snapshotter backend an image is unpacked with (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Snapshotter {
    /// Unpacks to a plain directory; produces a [`Mount::kind`] of
    /// [`crate::domain::MountKind::FilesystemPath`].
    Native,
    /// Unpacks to a block device; produces
    /// [`crate::domain::MountKind::BlockDevice`].
    Devmapper,
}

impl std::str::FromStr for Snapshotter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Self::Native),
            "devmapper" => Ok(Self::Devmapper),
            other => Err(format!("unsupported snapshotter: {other}")),
        }
    }
}

/// Pulls and mounts OCI images, scoping work to a per-VM lease (§4.2).
#[async_trait]
pub trait ImagePort: Send + Sync {
    /// Pulls `image_name` (if not already cached), unpacks it with
    /// `snapshotter`, and prepares or reuses a snapshot keyed
    /// `(owner, image_id)`. Returns the resulting mount.
    async fn pull_and_mount(
        &self,
        owner: &str,
        image_name: &str,
        image_id: &str,
        snapshotter: Snapshotter,
    ) -> Result<Mount, PortError>;

    /// Deletes the owner's lease, cascading to every snapshot it pinned.
    async fn cleanup(&self, owner: &str) -> Result<(), PortError>;
}

/// Host bridge/TAP/neighbor operations (§4.3).
#[async_trait]
pub trait NetworkPort: Send + Sync {
    /// Returns `true` if a bridge with this name exists.
    async fn bridge_exists(&self, name: &str) -> Result<bool, PortError>;

    /// Creates a bridge. Not used by the core create path (bridges must
    /// pre-exist) but kept for completeness and CLI/admin tooling.
    async fn bridge_create(&self, name: &str) -> Result<(), PortError>;

    /// Deletes a bridge.
    async fn bridge_delete(&self, name: &str) -> Result<(), PortError>;

    /// Creates a TAP device, assigning `mac` if non-empty, and brings it up.
    async fn interface_create(&self, name: &str, mac: &str) -> Result<(), PortError>;

    /// Deletes an interface. Tolerates the interface already being gone.
    async fn interface_delete(&self, name: &str) -> Result<(), PortError>;

    /// Returns `true` if an interface with this name exists.
    async fn interface_exists(&self, name: &str) -> Result<bool, PortError>;

    /// Enslaves `if_name` to `bridge_name`.
    async fn attach_to_bridge(&self, if_name: &str, bridge_name: &str) -> Result<(), PortError>;

    /// Enumerates `{prefix}0, {prefix}1, ...` and returns the first name
    /// that does not already exist. Gives up after 1000 attempts.
    async fn new_interface_name(&self, prefix: &str) -> Result<String, PortError>;

    /// Scans the IPv4 neighbor table for `mac`. Returns an empty string
    /// (not an error) if no entry exists yet; the orchestrator retries.
    async fn get_ip_from_mac(&self, mac: &str) -> Result<String, PortError>;
}

/// A single file to seed into a disk image, by its in-image path (§4.4).
#[derive(Debug, Clone)]
pub struct DiskFile {
    /// Path the file should have inside the produced image.
    pub path: String,
    /// Base64-encoded file content.
    pub content_base64: String,
}

/// Filesystem type for [`DiskPort::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiskImageType {
    /// FAT32 filesystem.
    Fat32,
    /// ISO 9660 filesystem.
    Iso9660,
}

/// Builds small labeled disk images containing cloud-init files (§4.4).
#[async_trait]
pub trait DiskPort: Send + Sync {
    /// Creates a disk image at `path`, labeled `volume_name`, sized per
    /// `size` (a human-readable string such as `"8Mb"`), containing
    /// `files`. If `overwrite` is false and `path` already exists, fails.
    async fn create(
        &self,
        path: &Path,
        size: &str,
        volume_name: &str,
        image_type: DiskImageType,
        overwrite: bool,
        files: &[DiskFile],
    ) -> Result<(), PortError>;
}

/// Composes provider-specific arguments, spawns, and supervises the VMM
/// process (§4.5).
#[async_trait]
pub trait VmmProvider: Send + Sync {
    /// Spawns the hypervisor for `vm`, whose `status` is already fully
    /// populated. Persists the PID and redirects stdout/stderr to the
    /// paths the state store names.
    async fn create(&self, vm: &Vm) -> Result<(), PortError>;

    /// Sends a soft-stop signal to the VM's process, if a PID is known.
    /// Tolerates a missing PID.
    async fn stop(&self, name: &str) -> Result<(), PortError>;

    /// Force-kills the VM's process, if still alive. Tolerates a missing
    /// PID.
    async fn delete(&self, name: &str) -> Result<(), PortError>;

    /// Whether this provider exposes a guest-reachable metadata service
    /// (MMDS), driving stage 2 of create (§4.1).
    fn has_metadata_service(&self) -> bool;
}
