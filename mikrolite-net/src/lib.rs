//! Network port implementation (§4.3): bridges, TAP devices, and
//! neighbor-table IP lookups, all driven through `rtnetlink` plus a small
//! raw `TUNSETIFF` helper for TAP creation itself.

mod netlink;
mod tap;

use async_trait::async_trait;
use mikrolite::ports::{NetworkPort, PortError};
use tracing::debug;

use netlink::Netlink;

/// Errors from network operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A netlink request failed.
    #[error("netlink: {0}")]
    Netlink(String),

    /// A MAC address string could not be parsed.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Filesystem or ioctl I/O error creating a TAP device.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Network port backed by a live `rtnetlink` connection.
#[derive(Debug)]
pub struct Net {
    netlink: Netlink,
}

impl Net {
    /// Opens a new netlink connection for this port to use.
    pub fn connect() -> Result<Self, Error> {
        Ok(Self { netlink: Netlink::connect()? })
    }
}

#[async_trait]
impl NetworkPort for Net {
    async fn bridge_exists(&self, name: &str) -> Result<bool, PortError> {
        Ok(self.netlink.link_exists(name).await?)
    }

    async fn bridge_create(&self, name: &str) -> Result<(), PortError> {
        self.netlink.bridge_add(name).await?;
        let Some(index) = self.netlink.find_link(name).await? else {
            return Err(Error::Netlink(format!("bridge {name} missing right after creation")).into());
        };
        self.netlink.link_up(index).await?;
        Ok(())
    }

    async fn bridge_delete(&self, name: &str) -> Result<(), PortError> {
        Ok(self.netlink.link_del(name).await?)
    }

    async fn interface_create(&self, name: &str, mac: &str) -> Result<(), PortError> {
        tap::create(name).map_err(Error::Io)?;
        let Some(index) = self.netlink.find_link(name).await? else {
            return Err(Error::Netlink(format!("TAP {name} missing right after creation")).into());
        };
        if !mac.is_empty() {
            self.netlink.link_set_address(index, parse_mac(mac)?).await?;
        }
        self.netlink.link_up(index).await?;
        debug!(interface = name, mac, "created TAP interface");
        Ok(())
    }

    async fn interface_delete(&self, name: &str) -> Result<(), PortError> {
        Ok(self.netlink.link_del(name).await?)
    }

    async fn interface_exists(&self, name: &str) -> Result<bool, PortError> {
        Ok(self.netlink.link_exists(name).await?)
    }

    async fn attach_to_bridge(&self, if_name: &str, bridge_name: &str) -> Result<(), PortError> {
        let Some(if_index) = self.netlink.find_link(if_name).await? else {
            return Err(Error::Netlink(format!("interface {if_name} not found")).into());
        };
        let Some(bridge_index) = self.netlink.find_link(bridge_name).await? else {
            return Err(Error::Netlink(format!("bridge {bridge_name} not found")).into());
        };
        self.netlink.link_set_master(if_index, bridge_index).await?;
        Ok(())
    }

    async fn new_interface_name(&self, prefix: &str) -> Result<String, PortError> {
        for i in 0..1000 {
            let candidate = format!("{prefix}{i}");
            if !self.netlink.link_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(Error::Netlink(format!("exhausted interface names for prefix {prefix}")).into())
    }

    async fn get_ip_from_mac(&self, mac: &str) -> Result<String, PortError> {
        let bytes = parse_mac(mac)?;
        Ok(self
            .netlink
            .neighbour_ip_for_mac(bytes)
            .await?
            .map(|ip| ip.to_string())
            .unwrap_or_default())
    }
}

/// Parses a colon-separated hex MAC string into 6 bytes.
fn parse_mac(mac: &str) -> Result<[u8; 6], Error> {
    let mut bytes = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in &mut bytes {
        let part = parts
            .next()
            .ok_or_else(|| Error::InvalidMac(mac.to_owned()))?;
        *byte =
            u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(mac.to_owned()))?;
    }
    if parts.next().is_some() {
        return Err(Error::InvalidMac(mac.to_owned()));
    }
    Ok(bytes)
}
