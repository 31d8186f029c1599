//! Thin wrapper over an `rtnetlink` handle for bridge/TAP/neighbor
//! operations (§4.3).

use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt as _;
use rtnetlink::Handle;
use rtnetlink::packet::neighbour::Nla as NeighbourNla;

use crate::Error;

/// A connected netlink handle. Owns the background connection task for as
/// long as it's alive.
#[derive(Debug)]
pub struct Netlink {
    handle: Handle,
    _connection: tokio::task::JoinHandle<()>,
}

impl Netlink {
    /// Opens a new netlink connection, spawning its I/O driver task.
    pub fn connect() -> Result<Self, Error> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| Error::Netlink(e.to_string()))?;
        let _connection = tokio::spawn(connection);
        Ok(Self { handle, _connection })
    }

    /// Finds a link's index by name, if it exists.
    pub async fn find_link(&self, name: &str) -> Result<Option<u32>, Error> {
        let mut links = self.handle.link().get().match_name(name.to_owned()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Netlink(e.to_string())),
        }
    }

    /// Returns `true` if a link named `name` exists.
    pub async fn link_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.find_link(name).await?.is_some())
    }

    /// Creates a bridge device.
    pub async fn bridge_add(&self, name: &str) -> Result<(), Error> {
        self.handle
            .link()
            .add()
            .bridge(name.to_owned())
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))
    }

    /// Deletes a link by name. Tolerates it already being gone.
    pub async fn link_del(&self, name: &str) -> Result<(), Error> {
        let Some(index) = self.find_link(name).await? else {
            return Ok(());
        };
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))
    }

    /// Brings a link up.
    pub async fn link_up(&self, index: u32) -> Result<(), Error> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))
    }

    /// Sets a link's hardware address.
    pub async fn link_set_address(&self, index: u32, mac: [u8; 6]) -> Result<(), Error> {
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))
    }

    /// Enslaves `index` to the bridge `master_index`.
    pub async fn link_set_master(&self, index: u32, master_index: u32) -> Result<(), Error> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))
    }

    /// Scans the IPv4 neighbor table for an entry whose link-local
    /// (hardware) address matches `mac`, returning its IP if found.
    pub async fn neighbour_ip_for_mac(&self, mac: [u8; 6]) -> Result<Option<Ipv4Addr>, Error> {
        let mut neighbours = self.handle.neighbours().get().execute();
        while let Some(msg) = neighbours
            .try_next()
            .await
            .map_err(|e| Error::Netlink(e.to_string()))?
        {
            let mut lladdr = None;
            let mut dest = None;
            for nla in &msg.nlas {
                match nla {
                    NeighbourNla::LinkLocalAddress(addr) => lladdr = Some(addr.clone()),
                    NeighbourNla::Destination(addr) => dest = Some(addr.clone()),
                    _ => {}
                }
            }
            if lladdr.as_deref() == Some(mac.as_slice()) {
                if let Some(ip) = dest.and_then(|bytes| to_ipv4(&bytes)) {
                    return Ok(Some(ip));
                }
            }
        }
        Ok(None)
    }
}

fn to_ipv4(bytes: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = bytes.try_into().ok()?;
    match IpAddr::from(octets) {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}
