//! In-process mock port implementations driving the orchestrator's own
//! test suite (§8). Not exported outside the crate; real callers wire up
//! `mikrolite-oci`/`mikrolite-net`/`mikrolite-disk`/`mikrolite-vmm` instead.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{Mount, MountKind, Vm};
use crate::ports::{
    DiskFile, DiskImageType, DiskPort, ImagePort, NetworkPort, PortError, Snapshotter, VmmProvider,
};

/// Always succeeds; records nothing callers need to assert on beyond the
/// returned mount location.
#[derive(Debug, Default)]
pub struct MockImage;

#[async_trait]
impl ImagePort for MockImage {
    async fn pull_and_mount(
        &self,
        owner: &str,
        image_name: &str,
        image_id: &str,
        _snapshotter: Snapshotter,
    ) -> Result<Mount, PortError> {
        Ok(Mount {
            kind: MountKind::FilesystemPath,
            location: format!("/mock/snapshots/{owner}/{image_id}/{image_name}"),
        })
    }

    async fn cleanup(&self, _owner: &str) -> Result<(), PortError> {
        Ok(())
    }
}

/// In-memory bridges and TAPs; `get_ip_from_mac` is driven by
/// [`Self::resolve_all_to`] or [`Self::set_neighbor_ip`].
#[derive(Debug, Default)]
pub struct MockNetwork {
    bridges: Mutex<HashSet<String>>,
    taps: Mutex<Vec<String>>,
    neighbors: Mutex<std::collections::HashMap<String, String>>,
    resolve_all: Mutex<Option<String>>,
}

impl MockNetwork {
    /// Seeds the mock with a set of pre-existing bridges.
    #[must_use]
    pub fn with_bridges(names: &[&str]) -> Self {
        Self {
            bridges: Mutex::new(names.iter().map(|s| (*s).to_owned()).collect()),
            ..Self::default()
        }
    }

    /// Records a MAC -> IP mapping for [`NetworkPort::get_ip_from_mac`].
    pub fn set_neighbor_ip(&self, mac: &str, ip: &str) {
        self.neighbors
            .lock()
            .expect("lock")
            .insert(mac.to_owned(), ip.to_owned());
    }

    /// Makes every MAC resolve to `ip`, regardless of what was generated;
    /// stands in for a real neighbor-table hit when the test doesn't know
    /// the randomly generated MAC in advance.
    pub fn resolve_all_to(&self, ip: &str) {
        *self.resolve_all.lock().expect("lock") = Some(ip.to_owned());
    }

    /// Number of TAPs created so far.
    #[must_use]
    pub fn tap_count(&self) -> usize {
        self.taps.lock().expect("lock").len()
    }
}

#[async_trait]
impl NetworkPort for MockNetwork {
    async fn bridge_exists(&self, name: &str) -> Result<bool, PortError> {
        Ok(self.bridges.lock().expect("lock").contains(name))
    }

    async fn bridge_create(&self, name: &str) -> Result<(), PortError> {
        self.bridges.lock().expect("lock").insert(name.to_owned());
        Ok(())
    }

    async fn bridge_delete(&self, name: &str) -> Result<(), PortError> {
        self.bridges.lock().expect("lock").remove(name);
        Ok(())
    }

    async fn interface_create(&self, name: &str, _mac: &str) -> Result<(), PortError> {
        self.taps.lock().expect("lock").push(name.to_owned());
        Ok(())
    }

    async fn interface_delete(&self, name: &str) -> Result<(), PortError> {
        self.taps.lock().expect("lock").retain(|t| t != name);
        Ok(())
    }

    async fn interface_exists(&self, name: &str) -> Result<bool, PortError> {
        Ok(self.taps.lock().expect("lock").iter().any(|t| t == name))
    }

    async fn attach_to_bridge(&self, _if_name: &str, bridge_name: &str) -> Result<(), PortError> {
        if self.bridges.lock().expect("lock").contains(bridge_name) {
            Ok(())
        } else {
            Err(format!("bridge {bridge_name} missing").into())
        }
    }

    async fn new_interface_name(&self, prefix: &str) -> Result<String, PortError> {
        let taps = self.taps.lock().expect("lock");
        for i in 0..1000 {
            let candidate = format!("{prefix}{i}");
            if !taps.iter().any(|t| t == &candidate) {
                return Ok(candidate);
            }
        }
        Err(format!("exhausted interface names for prefix {prefix}").into())
    }

    async fn get_ip_from_mac(&self, mac: &str) -> Result<String, PortError> {
        if let Some(ip) = self.resolve_all.lock().expect("lock").clone() {
            return Ok(ip);
        }
        Ok(self
            .neighbors
            .lock()
            .expect("lock")
            .get(mac)
            .cloned()
            .unwrap_or_default())
    }
}

/// Always succeeds without writing anything to disk.
#[derive(Debug, Default)]
pub struct MockDisk;

#[async_trait]
impl DiskPort for MockDisk {
    async fn create(
        &self,
        _path: &Path,
        _size: &str,
        _volume_name: &str,
        _image_type: DiskImageType,
        _overwrite: bool,
        _files: &[DiskFile],
    ) -> Result<(), PortError> {
        Ok(())
    }
}

/// Records nothing beyond whether it exposes a metadata service.
#[derive(Debug)]
pub struct MockProvider {
    has_mmds: bool,
}

impl MockProvider {
    /// Creates a mock provider, optionally exposing a metadata service.
    #[must_use]
    pub fn new(has_mmds: bool) -> Self {
        Self { has_mmds }
    }
}

#[async_trait]
impl VmmProvider for MockProvider {
    async fn create(&self, _vm: &Vm) -> Result<(), PortError> {
        Ok(())
    }

    async fn stop(&self, _name: &str) -> Result<(), PortError> {
        Ok(())
    }

    async fn delete(&self, _name: &str) -> Result<(), PortError> {
        Ok(())
    }

    fn has_metadata_service(&self) -> bool {
        self.has_mmds
    }
}
