//! Per-VM state directory: `vm.json`, PID file, log/stdout/stderr paths,
//! and metadata file (§4.7).

use std::fs;
use std::path::PathBuf;

use crate::domain::Vm;
use crate::error::{Error, Result};

/// Manages the on-disk state directory tree rooted at `<state_root>`.
///
/// `<state_root>/<vm.name>/` holds `vm.json`, `vm.pid`, `vm.log`,
/// `vm.stdout`, `vm.stderr`, `metadata.json`, and provider-specific socket
/// files. JSON writes are whole-file replacements with single-space
/// indentation; listing iterates the direct subdirectories of
/// `<state_root>`.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

/// Single-space JSON pretty-printer (§4.7: "pretty indentation, single-space
/// indent").
fn to_pretty_single_space<T: serde::Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}

impl StateStore {
    /// Opens (creating if necessary) the state root directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Directory for a single VM's state.
    #[must_use]
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Path to `vm.json`.
    #[must_use]
    pub fn vm_json_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.json")
    }

    /// Path to the PID file.
    #[must_use]
    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.pid")
    }

    /// Path to the hypervisor log file.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.log")
    }

    /// Path to the redirected stdout file.
    #[must_use]
    pub fn stdout_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.stdout")
    }

    /// Path to the redirected stderr file.
    #[must_use]
    pub fn stderr_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("vm.stderr")
    }

    /// Path to the firecracker-provider `metadata.json` file.
    #[must_use]
    pub fn metadata_json_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("metadata.json")
    }

    /// Path to a provider-specific socket file, e.g. `firecracker.sock`.
    #[must_use]
    pub fn socket_path(&self, name: &str, filename: &str) -> PathBuf {
        self.vm_dir(name).join(filename)
    }

    /// `true` if `vm.json` exists: a VM with this name logically exists
    /// (invariant 1, §3).
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.vm_json_path(name).is_file()
    }

    /// Creates the per-VM state directory.
    pub fn create_dir(&self, name: &str) -> Result<()> {
        let dir = self.vm_dir(name);
        fs::create_dir_all(&dir).map_err(|e| Error::io(dir.display().to_string(), e))
    }

    /// Writes `vm.json`, replacing any existing file.
    pub fn save(&self, vm: &Vm) -> Result<()> {
        let path = self.vm_json_path(&vm.name);
        let bytes =
            to_pretty_single_space(vm).map_err(|e| Error::io(path.display().to_string(), e.into()))?;
        fs::write(&path, bytes).map_err(|e| Error::io(path.display().to_string(), e))
    }

    /// Loads `vm.json`.
    pub fn load(&self, name: &str) -> Result<Vm> {
        let path = self.vm_json_path(name);
        let data = fs::read_to_string(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
        serde_json::from_str(&data).map_err(|e| Error::io(path.display().to_string(), e.into()))
    }

    /// Lists every VM recorded under the state root, by reading each
    /// direct subdirectory's `vm.json`. Subdirectories without a `vm.json`
    /// (a partially created VM) are skipped.
    pub fn list(&self) -> Result<Vec<Vm>> {
        let mut vms = Vec::new();
        let entries =
            fs::read_dir(&self.root).map_err(|e| Error::io(self.root.display().to_string(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(self.root.display().to_string(), e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.exists(&name) {
                vms.push(self.load(&name)?);
            }
        }
        Ok(vms)
    }

    /// Writes the PID file.
    pub fn save_pid(&self, name: &str, pid: u32) -> Result<()> {
        let path = self.pid_path(name);
        fs::write(&path, pid.to_string()).map_err(|e| Error::io(path.display().to_string(), e))
    }

    /// Reads the PID file. Returns `0` if absent, signaling "never
    /// started" to callers (§4.7, invariant 5 in §3).
    #[must_use]
    pub fn get_pid(&self, name: &str) -> u32 {
        fs::read_to_string(self.pid_path(name))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Removes the entire per-VM state directory tree. Tolerates the
    /// directory already being gone.
    pub fn remove_dir(&self, name: &str) -> Result<()> {
        let dir = self.vm_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(dir.display().to_string(), e)),
        }
    }
}

/// Returns the `vm-<name>` owner string used to namespace image leases and
/// snapshot keys, so removal can atomically release everything
/// attributable to one VM.
#[must_use]
pub fn owner_of(name: &str) -> String {
    format!("vm-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Kernel, KernelSource, Network, Vm, VmSpec, Volume, VolumeSource};
    use std::collections::BTreeMap;

    fn sample_vm(name: &str) -> Vm {
        Vm::new(
            name,
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
                    source: VolumeSource::Raw {
                        path: "/tmp/root.img".to_owned(),
                    },
                },
                additional_volumes: Vec::new(),
                vcpu: 1,
                memory_mib: 512,
                network: Network {
                    bridge_name: "br0".to_owned(),
                    interfaces: BTreeMap::new(),
                },
                bootstrap: None,
            },
        )
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = StateStore::open(dir.path()).expect("open");
        let vm = sample_vm("vm1");

        store.create_dir(&vm.name).expect("create_dir");
        store.save(&vm).expect("save");

        assert!(store.exists("vm1"));
        let loaded = store.load("vm1").expect("load");
        assert_eq!(loaded.name, "vm1");
        assert_eq!(loaded.spec.vcpu, 1);
    }

    #[test]
    fn list_skips_dirs_without_vm_json() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = StateStore::open(dir.path()).expect("open");

        let vm = sample_vm("vm1");
        store.create_dir(&vm.name).expect("create_dir");
        store.save(&vm).expect("save");

        // A stray directory with no vm.json (half-created VM).
        store.create_dir("vm2").expect("create_dir");

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "vm1");
    }

    #[test]
    fn pid_absent_reads_as_zero() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = StateStore::open(dir.path()).expect("open");
        store.create_dir("vm1").expect("create_dir");

        assert_eq!(store.get_pid("vm1"), 0);

        store.save_pid("vm1", 4242).expect("save_pid");
        assert_eq!(store.get_pid("vm1"), 4242);
    }

    #[test]
    fn remove_dir_tolerates_missing() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let store = StateStore::open(dir.path()).expect("open");
        store.remove_dir("never-created").expect("remove_dir");
    }
}
