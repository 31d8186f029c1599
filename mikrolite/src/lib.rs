//! Host-side microVM lifecycle controller.
//!
//! `mikrolite` orchestrates the create/remove lifecycle of a microVM around
//! four pluggable ports (image, network, disk, and VMM provider) rather
//! than owning any hypervisor integration itself. Concrete ports live in
//! their own crates (`mikrolite-oci`, `mikrolite-net`, `mikrolite-disk`,
//! `mikrolite-vmm`); this crate owns the domain model, the state store, and
//! the orchestrator that drives them.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mikrolite::{CancellationToken, Orchestrator, Snapshotters, StateStore};
//! use mikrolite::ports::Snapshotter;
//!
//! # async fn run(
//! #     image: Arc<dyn mikrolite::ports::ImagePort>,
//! #     network: Arc<dyn mikrolite::ports::NetworkPort>,
//! #     disk: Arc<dyn mikrolite::ports::DiskPort>,
//! #     provider: Arc<dyn mikrolite::ports::VmmProvider>,
//! #     spec: mikrolite::VmSpec,
//! # ) -> mikrolite::Result<()> {
//! let state = StateStore::open("/var/lib/mikrolite")?;
//! let orchestrator = Orchestrator::new(
//!     image,
//!     network,
//!     disk,
//!     provider,
//!     state,
//!     Snapshotters { kernel: Snapshotter::Native, volume: Snapshotter::Native },
//! );
//! orchestrator.create("my-vm", spec, &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod cancellation;
mod domain;
mod error;
mod mac;
mod orchestrator;
pub mod ports;
mod state;

#[cfg(test)]
mod testing;

pub use cancellation::CancellationToken;
pub use domain::{
    Bootstrap, Interface, Kernel, KernelSource, Mount, MountKind, NetStatus, Network,
    ROOT_VOLUME_KEY, StaticIpv4, Vm, VmSpec, VmStatus, Volume, VolumeSource,
};
pub use error::{Error, Result};
pub use mac::generate as generate_mac;
pub use orchestrator::{Orchestrator, Snapshotters};
pub use state::{StateStore, owner_of};
