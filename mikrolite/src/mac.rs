//! Locally administered, unicast MAC address generation (§6).

/// Generates a random locally-administered unicast MAC address: bit 1 of
/// the first octet set (locally administered), bit 0 cleared (unicast).
#[must_use]
pub fn generate() -> String {
    let mut octets = rand::random::<[u8; 6]>();
    octets[0] = (octets[0] | 0x02) & !0x01;

    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_mac_is_locally_administered_unicast() {
        let mac = generate();
        let first_octet = u8::from_str_radix(&mac[0..2], 16).expect("hex");
        assert_eq!(first_octet & 0x02, 0x02, "locally administered bit must be set");
        assert_eq!(first_octet & 0x01, 0x00, "unicast bit must be clear");
        assert_eq!(mac.len(), 17);
    }

    #[test]
    fn generated_macs_vary() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }
}
