//! Cloud-init document encoding (§4.6).
//!
//! Produces the three base64-encoded YAML documents a cloud-init-aware
//! guest reads from its seed volume: `meta-data`, `user-data`, and
//! `network-config`. Grounded in `examples/original_source/cloudinit/`
//! (`cloudinit.go`, `network.go`) from the upstream Go implementation this
//! system was distilled from. The key names, the `CIDATA` volume label,
//! and the netplan-v2 network-config shape all come from there.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Metadata key for the `meta-data` document.
pub const INSTANCE_DATA_KEY: &str = "meta-data";
/// Metadata key for the `user-data` document.
pub const USER_DATA_KEY: &str = "user-data";
/// Metadata key for the `vendor-data` document.
pub const VENDOR_DATA_KEY: &str = "vendor-data";
/// Metadata key for the `network-config` document.
pub const NETWORK_CONFIG_DATA_KEY: &str = "network-config";
/// Label applied to the cloud-init seed volume.
pub const VOLUME_NAME: &str = "CIDATA";

/// `true` if `key` is one of the four cloud-init metadata keys this crate
/// knows how to materialize as a file.
#[must_use]
pub fn is_cloud_init_key(key: &str) -> bool {
    matches!(
        key,
        INSTANCE_DATA_KEY | NETWORK_CONFIG_DATA_KEY | USER_DATA_KEY | VENDOR_DATA_KEY
    )
}

/// Encodes the `meta-data` document: `{ instance_id, cloud_name }`.
#[must_use]
pub fn encode_meta_data(vm_name: &str) -> String {
    #[derive(Serialize)]
    struct MetaData<'a> {
        instance_id: &'a str,
        cloud_name: &'static str,
    }

    let doc = MetaData {
        instance_id: vm_name,
        cloud_name: "mikrolite",
    };
    let yaml = serde_yaml::to_string(&doc).unwrap_or_default();
    BASE64.encode(yaml)
}

/// SSH user to seed when `ssh_authorized_key` is set in [`UserData`].
const SSH_USER_NAME: &str = "ml";

/// Inputs for the `user-data` document, present only when the VM spec
/// declares a `bootstrap` block.
#[derive(Debug, Clone)]
pub struct UserData {
    /// Hostname to set in the guest.
    pub hostname: String,
    /// Contents of an SSH public key file, if `bootstrap.ssh_key_path` was
    /// set.
    pub ssh_authorized_key: Option<String>,
}

/// Encodes the `user-data` document: fixed `final_message`/`bootcmd`
/// fields, the VM's name as hostname, and (if an SSH key was supplied) a
/// single passwordless-sudo user seeded with that key.
#[must_use]
pub fn encode_user_data(input: &UserData) -> String {
    #[derive(Serialize)]
    struct User<'a> {
        name: &'a str,
        gecos: &'static str,
        shell: &'static str,
        groups: &'static str,
        sudo: &'static str,
        ssh_authorized_keys: Vec<&'a str>,
    }

    #[derive(Serialize)]
    struct Doc<'a> {
        final_message: &'static str,
        bootcmd: [&'static str; 1],
        hostname: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        users: Option<Vec<User<'a>>>,
    }

    let users = input.ssh_authorized_key.as_deref().map(|key| {
        vec![User {
            name: SSH_USER_NAME,
            gecos: "Mikrolite user",
            shell: "/bin/bash",
            groups: "sudo",
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            ssh_authorized_keys: vec![key],
        }]
    });

    let doc = Doc {
        final_message: "mikrolite booted system",
        bootcmd: ["ln -sf /run/systemd/resolve/stub-resolv.conf /etc/resolv.conf"],
        hostname: &input.hostname,
        users,
    };

    let yaml = serde_yaml::to_string(&doc).unwrap_or_default();
    let full = format!("## template: jinja\n#cloud-config\n\n{yaml}");
    BASE64.encode(full)
}

/// One network interface's worth of netplan-v2 input for
/// [`encode_network_config`].
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    /// Guest device name; the key under `ethernets` in the produced YAML.
    pub guest_device_name: String,
    /// Generated guest MAC address, matched on via `match.macaddress`.
    pub mac: String,
    /// Static IPv4 configuration. `None` means DHCP.
    pub static_ipv4: Option<StaticIpv4>,
}

/// Static IPv4 configuration for a [`NetworkInterface`].
#[derive(Debug, Clone)]
pub struct StaticIpv4 {
    /// Address in CIDR form, e.g. `10.0.0.5/24`.
    pub address: String,
    /// Gateway address in CIDR form; only the address part is emitted as
    /// `gateway4`.
    pub gateway: Option<String>,
    /// Nameserver addresses.
    pub nameservers: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct Match {
    #[serde(skip_serializing_if = "Option::is_none")]
    macaddress: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Nameservers {
    #[serde(skip_serializing_if = "Option::is_none")]
    addresses: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct Ethernet {
    r#match: Match,
    #[serde(skip_serializing_if = "Option::is_none")]
    addresses: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dhcp4: Option<bool>,
    #[serde(rename = "dhcp-identifier", skip_serializing_if = "Option::is_none")]
    dhcp_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nameservers: Option<Nameservers>,
}

#[derive(Serialize, Deserialize)]
struct NetworkConfig {
    version: u8,
    ethernets: std::collections::BTreeMap<String, Ethernet>,
}

/// Extracts the address portion of a CIDR string (`"10.0.0.1/24"` ->
/// `"10.0.0.1"`).
fn address_part(cidr: &str) -> &str {
    cidr.split('/').next().unwrap_or(cidr)
}

/// Encodes the `network-config` document: netplan v2, one `ethernets`
/// entry per interface, matched by MAC. DHCP unless a static address is
/// given.
#[must_use]
pub fn encode_network_config(interfaces: &[NetworkInterface]) -> String {
    let mut ethernets = std::collections::BTreeMap::new();

    for iface in interfaces {
        let entry = if let Some(static_ipv4) = &iface.static_ipv4 {
            Ethernet {
                r#match: Match {
                    macaddress: Some(iface.mac.clone()),
                },
                addresses: Some(vec![static_ipv4.address.clone()]),
                gateway4: static_ipv4.gateway.as_deref().map(address_part).map(str::to_owned),
                dhcp4: Some(false),
                dhcp_identifier: None,
                nameservers: static_ipv4.nameservers.clone().map(|addresses| Nameservers {
                    addresses: Some(addresses),
                }),
            }
        } else {
            Ethernet {
                r#match: Match {
                    macaddress: Some(iface.mac.clone()),
                },
                addresses: None,
                gateway4: None,
                dhcp4: Some(true),
                dhcp_identifier: Some("mac".to_owned()),
                nameservers: None,
            }
        };
        ethernets.insert(iface.guest_device_name.clone(), entry);
    }

    let doc = NetworkConfig {
        version: 2,
        ethernets,
    };
    let yaml = serde_yaml::to_string(&doc).unwrap_or_default();
    BASE64.encode(yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(b64: &str) -> String {
        String::from_utf8(BASE64.decode(b64).expect("valid base64")).expect("utf8")
    }

    #[test]
    fn meta_data_contains_instance_id() {
        let encoded = encode_meta_data("vm1");
        let yaml = decode(&encoded);
        assert!(yaml.contains("instance_id: vm1"));
        assert!(yaml.contains("cloud_name: mikrolite"));
    }

    #[test]
    fn user_data_without_ssh_key_has_no_users() {
        let encoded = encode_user_data(&UserData {
            hostname: "vm1".to_owned(),
            ssh_authorized_key: None,
        });
        let text = decode(&encoded);
        assert!(text.starts_with("## template: jinja\n#cloud-config\n"));
        assert!(!text.contains("users:"));
        assert!(text.contains("hostname: vm1"));
    }

    #[test]
    fn user_data_with_ssh_key_seeds_ml_user() {
        let encoded = encode_user_data(&UserData {
            hostname: "vm1".to_owned(),
            ssh_authorized_key: Some("ssh-ed25519 AAAA... user@host".to_owned()),
        });
        let text = decode(&encoded);
        assert!(text.contains("name: ml"));
        assert!(text.contains("ssh-ed25519 AAAA... user@host"));
        assert!(text.contains("NOPASSWD:ALL"));
    }

    #[test]
    fn network_config_dhcp_by_default() {
        let encoded = encode_network_config(&[NetworkInterface {
            guest_device_name: "eth0".to_owned(),
            mac: "02:00:00:00:00:01".to_owned(),
            static_ipv4: None,
        }]);
        let yaml = decode(&encoded);
        let parsed: NetworkConfig = serde_yaml::from_str(&yaml).expect("parse");
        let eth0 = &parsed.ethernets["eth0"];
        assert_eq!(eth0.dhcp4, Some(true));
        assert_eq!(eth0.dhcp_identifier.as_deref(), Some("mac"));
        assert_eq!(eth0.r#match.macaddress.as_deref(), Some("02:00:00:00:00:01"));
    }

    #[test]
    fn network_config_static_ipv4() {
        let encoded = encode_network_config(&[NetworkInterface {
            guest_device_name: "eth0".to_owned(),
            mac: "02:00:00:00:00:01".to_owned(),
            static_ipv4: Some(StaticIpv4 {
                address: "10.0.0.5/24".to_owned(),
                gateway: Some("10.0.0.1/24".to_owned()),
                nameservers: Some(vec!["8.8.8.8".to_owned()]),
            }),
        }]);
        let yaml = decode(&encoded);
        let parsed: NetworkConfig = serde_yaml::from_str(&yaml).expect("parse");
        let eth0 = &parsed.ethernets["eth0"];
        assert_eq!(eth0.dhcp4, Some(false));
        assert_eq!(eth0.addresses, Some(vec!["10.0.0.5/24".to_owned()]));
        assert_eq!(eth0.gateway4.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn is_cloud_init_key_recognizes_exactly_four_keys() {
        assert!(is_cloud_init_key(INSTANCE_DATA_KEY));
        assert!(is_cloud_init_key(USER_DATA_KEY));
        assert!(is_cloud_init_key(VENDOR_DATA_KEY));
        assert!(is_cloud_init_key(NETWORK_CONFIG_DATA_KEY));
        assert!(!is_cloud_init_key("something-else"));
    }
}
