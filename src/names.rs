//! Safe resource names.
//!
//! Child resource names are derived from the CGU and parent policy names and
//! can exceed Kubernetes name limits. Every desired name passes through the
//! [`SafeNameRegistry`], the only component allowed to mint safe names: the
//! first mint truncates and suffixes as needed and records the mapping in
//! the CGU status, and every later reconcile returns the recorded name
//! unchanged for the lifetime of the CGU.

use std::collections::BTreeMap;

/// Length of the `-xxxxx` suffix appended when truncating
const SUFFIX_LEN: usize = 6;

/// Mints and remembers bounded-length names for one CGU.
///
/// Wraps the CGU status `safeResourceNames` map mutably; the caller persists
/// the status afterwards.
pub struct SafeNameRegistry<'a> {
    names: &'a mut BTreeMap<String, String>,
}

impl<'a> SafeNameRegistry<'a> {
    /// Wrap the CGU's persisted desired-name -> safe-name map
    pub fn new(names: &'a mut BTreeMap<String, String>) -> Self {
        Self { names }
    }

    /// The safe name for `desired`, minting one on first use.
    ///
    /// `max_len` is the hard bound for the stored name and `reserved` the
    /// number of characters consumed elsewhere (a policy copy's name must
    /// also fit the `<namespace>.<name>` child form on managed clusters).
    pub fn safe_name(&mut self, desired: &str, max_len: usize, reserved: usize) -> String {
        if let Some(existing) = self.names.get(desired) {
            return existing.clone();
        }

        let budget = max_len.saturating_sub(reserved);
        let safe = if desired.len() <= budget {
            desired.to_string()
        } else if budget <= SUFFIX_LEN {
            // Degenerate budget: no room for a suffix at all.
            desired[..budget].to_string()
        } else {
            let keep = budget - SUFFIX_LEN;
            format!("{}-{:05x}", &desired[..keep], short_hash(desired))
        };

        self.names.insert(desired.to_string(), safe.clone());
        safe
    }

    /// The already-minted safe name for `desired`, if any
    pub fn lookup(&self, desired: &str) -> Option<&str> {
        self.names.get(desired).map(|s| s.as_str())
    }
}

/// FNV-1a over the desired name, folded to 20 bits for a 5-hex-char suffix.
/// The suffix is deterministic so a re-mint after a crashed status write
/// converges on the same safe name.
fn short_hash(name: &str) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    (hash ^ (hash >> 20) ^ (hash >> 40)) as u32 & 0xf_ffff
}

/// Desired name of a child resource owned by a CGU
pub fn child_resource_name(cgu_name: &str, suffix: &str) -> String {
    format!("{cgu_name}-{suffix}")
}

/// Desired name of a remote observation object for an embedded policy object
pub fn observation_name(cgu_name: &str, kind: &str, object_name: &str) -> String {
    format!("{}-{}-{}", cgu_name, kind.to_lowercase(), object_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_names_pass_through() {
        let mut map = BTreeMap::new();
        let mut registry = SafeNameRegistry::new(&mut map);
        assert_eq!(registry.safe_name("cgu-policy1-placement", 253, 0), "cgu-policy1-placement");
        assert_eq!(map["cgu-policy1-placement"], "cgu-policy1-placement");
    }

    #[test]
    fn long_names_are_truncated_with_suffix() {
        let desired = "x".repeat(80);
        let mut map = BTreeMap::new();
        let mut registry = SafeNameRegistry::new(&mut map);

        let safe = registry.safe_name(&desired, 63, 0);
        assert_eq!(safe.len(), 63);
        assert!(safe.starts_with(&"x".repeat(57)));
        assert_eq!(safe.as_bytes()[57], b'-');
    }

    #[test]
    fn reserved_length_shrinks_the_budget() {
        let desired = "a".repeat(60);
        let mut map = BTreeMap::new();
        let mut registry = SafeNameRegistry::new(&mut map);

        // Reserving 10 characters (namespace + dot) forces truncation at 53.
        let safe = registry.safe_name(&desired, 63, 10);
        assert_eq!(safe.len(), 53);
    }

    #[test]
    fn registered_names_win_over_recomputation() {
        let mut map = BTreeMap::new();
        map.insert("desired".to_string(), "recorded-before".to_string());
        let mut registry = SafeNameRegistry::new(&mut map);
        assert_eq!(registry.safe_name("desired", 253, 0), "recorded-before");
    }

    #[test]
    fn remint_after_lost_status_converges() {
        let desired = "z".repeat(90);

        let mut first_map = BTreeMap::new();
        let first = SafeNameRegistry::new(&mut first_map).safe_name(&desired, 63, 0);

        // A second reconcile that never saw the first status write mints the
        // same name, so no duplicate child is created.
        let mut second_map = BTreeMap::new();
        let second = SafeNameRegistry::new(&mut second_map).safe_name(&desired, 63, 0);

        assert_eq!(first, second);
    }

    proptest! {
        #[test]
        fn safe_names_are_bounded_and_stable(
            desired in "[a-z0-9-]{1,300}",
            max_len in 10usize..253,
            reserved in 0usize..8,
        ) {
            let mut map = BTreeMap::new();
            let mut registry = SafeNameRegistry::new(&mut map);

            let first = registry.safe_name(&desired, max_len, reserved);
            let second = registry.safe_name(&desired, max_len, reserved);

            prop_assert_eq!(&first, &second);
            prop_assert!(first.len() <= max_len - reserved);
        }
    }
}
