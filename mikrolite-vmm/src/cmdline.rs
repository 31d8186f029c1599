//! Kernel command-line formatting, shared by both providers (§4.5).

use std::collections::BTreeMap;

/// Formats a cmdline mapping as `k` for empty values, `k=v` otherwise,
/// space-joined. `cmdline` is a `BTreeMap`, so this is already sorted by
/// key, giving a deterministic result without a separate sort step.
pub fn format(cmdline: &BTreeMap<String, String>) -> String {
    cmdline
        .iter()
        .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_key_value_pairs_sorted_by_key() {
        let mut cmdline = BTreeMap::new();
        cmdline.insert("root".to_owned(), "/dev/vda".to_owned());
        cmdline.insert("quiet".to_owned(), String::new());
        cmdline.insert("console".to_owned(), "hvc0".to_owned());
        assert_eq!(format(&cmdline), "console=hvc0 quiet root=/dev/vda");
    }
}
