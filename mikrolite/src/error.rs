//! Error kinds the orchestrator distinguishes and surfaces (§7).

/// Alias for `Result<T, mikrolite::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the lifecycle orchestrator and state store.
///
/// Every stage wraps lower-layer errors with a contextual prefix naming the
/// stage and the resource (image name, interface name, path) per the
/// propagation policy in §7. Only [`Error::AlreadyExists`] is a warning
/// rather than a fatal error at the CLI boundary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing name, missing spec, or an unspecified kernel source.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A VM with this name already has a `vm.json`.
    #[error("vm {name} already exists")]
    AlreadyExists {
        /// Name of the VM that already exists.
        name: String,
    },

    /// The declared bridge does not exist on the host.
    #[error("bridge {bridge} does not exist")]
    BridgeMissing {
        /// Name of the missing bridge.
        bridge: String,
    },

    /// Image pull, unpack, or snapshot failure.
    #[error("image error resolving {resource}: {source}")]
    Image {
        /// The image/volume/kernel identifier being resolved.
        resource: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Netlink create/attach/lookup failure.
    #[error("network error on {resource}: {source}")]
    Network {
        /// The interface or bridge name being operated on.
        resource: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Hypervisor spawn or socket handshake failure.
    #[error("provider error for vm {vm}: {source}")]
    Provider {
        /// Name of the VM the provider was operating on.
        vm: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Neighbor-table polling timed out before the guest IP resolved.
    #[error("ip not found for vm {vm} after {attempts} attempts")]
    IpNotFound {
        /// Name of the VM whose IP never resolved.
        vm: String,
        /// Number of polling attempts made.
        attempts: u32,
    },

    /// File or directory operation failure.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path the operation was acting on.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A snapshotter value outside `{native, devmapper}`.
    #[error("unsupported snapshotter: {0}")]
    UnsupportedSnapshotter(String),

    /// The cancellation token fired before the stage completed.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps an image-port error with the resource it was resolving.
    pub fn image(
        resource: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Image {
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Wraps a network-port error with the resource it was operating on.
    pub fn network(
        resource: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Wraps a provider error with the VM it was acting on.
    pub fn provider(
        vm: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Provider {
            vm: vm.into(),
            source: Box::new(source),
        }
    }

    /// Returns `true` for the one error kind the CLI treats as a warning
    /// rather than a fatal failure.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}
