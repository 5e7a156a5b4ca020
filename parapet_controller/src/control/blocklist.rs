//! Monotonic blocklist reconciliation
//!
//! Sampled offenders are merged into the persisted address set by pure set
//! union: the committed set is always a superset of every set read during
//! the cycle, and this component never removes an address. Address expiry is
//! deliberately not implemented here; a TTL-aware [`AddressSetStore`] can
//! expire entries server-side without the controller's involvement.

use crate::stores::{AddressSetStore, StoreResult};
use parapet_common::{AddressSetRef, RequestAction, SampledRequest};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

/// Union of the persisted set and the sampled candidates. Pure:
/// commutative, idempotent, and the identity on an empty candidate set.
pub fn reconcile(current: &BTreeSet<String>, candidates: &BTreeSet<String>) -> BTreeSet<String> {
    current.union(candidates).cloned().collect()
}

/// Extract blocklist candidates from a request sample: blocked requests
/// only, each source rendered as a single-address CIDR. Duplicate sources
/// collapse here; unparseable addresses are skipped.
pub fn candidates(samples: &[SampledRequest]) -> BTreeSet<String> {
    samples
        .iter()
        .filter(|s| s.action == RequestAction::Block)
        .filter_map(|s| match single_address_cidr(&s.source_address) {
            Some(cidr) => Some(cidr),
            None => {
                tracing::warn!(address = %s.source_address, "skipping unparseable sampled address");
                None
            }
        })
        .collect()
}

/// Single-address CIDR form: /32 for IPv4, /128 for IPv6
fn single_address_cidr(address: &str) -> Option<String> {
    match address.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(format!("{}/32", v4)),
        IpAddr::V6(v6) => Some(format!("{}/128", v6)),
    }
}

/// Persists reconciled address sets under compare-and-swap
pub struct BlocklistManager {
    address_sets: Arc<dyn AddressSetStore>,
    set_ref: AddressSetRef,
}

impl BlocklistManager {
    pub fn new(address_sets: Arc<dyn AddressSetStore>, set_ref: AddressSetRef) -> Self {
        Self {
            address_sets,
            set_ref,
        }
    }

    /// Commit a merged set.
    ///
    /// The lock token is fetched here, immediately before the write, never
    /// reused from a read earlier in the cycle: concurrent cycles or
    /// operators may have touched the set meanwhile. The freshly read
    /// addresses are folded into the union as well, so anything added
    /// between the cycle's pre-read and this commit survives.
    ///
    /// Returns the size of the committed set.
    pub async fn commit(&self, merged: BTreeSet<String>) -> StoreResult<u64> {
        let fresh = self.address_sets.get(&self.set_ref).await?;
        let combined = reconcile(&fresh.value.addresses, &merged);
        let added = combined.len() - fresh.value.addresses.len();

        self.address_sets
            .update(&self.set_ref, combined.clone(), fresh.lock_token)
            .await?;

        tracing::info!(
            set = %self.set_ref.name,
            total = combined.len(),
            added,
            "blocklist committed"
        );
        Ok(combined.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sampled(address: &str, action: RequestAction) -> SampledRequest {
        SampledRequest {
            source_address: address.to_string(),
            action,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_reconcile_is_commutative() {
        let a = set(&["1.2.3.4/32", "5.6.7.8/32"]);
        let b = set(&["5.6.7.8/32", "9.9.9.9/32"]);
        assert_eq!(reconcile(&a, &b), reconcile(&b, &a));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let a = set(&["1.2.3.4/32"]);
        assert_eq!(reconcile(&a, &a), a);
    }

    #[test]
    fn test_reconcile_empty_is_identity() {
        let a = set(&["1.2.3.4/32"]);
        assert_eq!(reconcile(&a, &BTreeSet::new()), a);
        assert_eq!(reconcile(&BTreeSet::new(), &a), a);
    }

    #[test]
    fn test_reconcile_result_is_superset() {
        let current = set(&["1.2.3.4/32"]);
        let incoming = set(&["5.6.7.8/32"]);
        let merged = reconcile(&current, &incoming);
        assert!(merged.is_superset(&current));
        assert!(merged.is_superset(&incoming));
    }

    #[test]
    fn test_merge_example_from_sample() {
        // current {1.2.3.4/32} + blocked sources {1.2.3.4, 5.6.7.8}
        // => {1.2.3.4/32, 5.6.7.8/32}, size 2
        let current = set(&["1.2.3.4/32"]);
        let samples = vec![
            sampled("1.2.3.4", RequestAction::Block),
            sampled("5.6.7.8", RequestAction::Block),
        ];
        let merged = reconcile(&current, &candidates(&samples));
        assert_eq!(merged, set(&["1.2.3.4/32", "5.6.7.8/32"]));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_candidates_keep_only_blocked() {
        let samples = vec![
            sampled("1.2.3.4", RequestAction::Allow),
            sampled("5.6.7.8", RequestAction::Block),
        ];
        assert_eq!(candidates(&samples), set(&["5.6.7.8/32"]));
    }

    #[test]
    fn test_candidates_dedup_repeated_sources() {
        let samples = vec![
            sampled("5.6.7.8", RequestAction::Block),
            sampled("5.6.7.8", RequestAction::Block),
            sampled("5.6.7.8", RequestAction::Block),
        ];
        assert_eq!(candidates(&samples).len(), 1);
    }

    #[test]
    fn test_candidates_render_ipv6_as_128() {
        let samples = vec![sampled("2001:db8::1", RequestAction::Block)];
        assert_eq!(candidates(&samples), set(&["2001:db8::1/128"]));
    }

    #[test]
    fn test_candidates_skip_garbage() {
        let samples = vec![
            sampled("not-an-address", RequestAction::Block),
            sampled("1.2.3.4", RequestAction::Block),
        ];
        assert_eq!(candidates(&samples), set(&["1.2.3.4/32"]));
    }
}
