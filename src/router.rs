//! Client-side endpoint selection.
//!
//! Order of precedence: an exact match of the route key against an
//! endpoint's app name or URL, then stable hashing of the key, then
//! round-robin. Hashing keeps a given key on the same backend across
//! calls; round-robin advances a per-service counter that wraps as a u32.

/// What the router needs to know about one live endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointLabel<'a> {
    pub app: &'a str,
    pub url: &'a str,
}

/// FNV-1a 32-bit hash — deterministic across Rust versions and platforms.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;
    let mut hash = FNV_OFFSET;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Pick an endpoint index out of `endpoints` for `route`.
///
/// The counter only advances on round-robin picks, so keyed traffic does
/// not perturb the rotation. Returns `None` when there is nothing to pick.
pub fn route_index(endpoints: &[EndpointLabel<'_>], route: &str, counter: &mut u32) -> Option<usize> {
    if endpoints.is_empty() {
        return None;
    }

    let n = endpoints.len();

    if !route.is_empty() {
        if let Some(idx) = endpoints
            .iter()
            .position(|e| e.app == route || e.url == route)
        {
            return Some(idx);
        }

        return Some(fnv1a_32(route.as_bytes()) as usize % n);
    }

    let idx = *counter as usize % n;
    *counter = counter.wrapping_add(1);
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<EndpointLabel<'static>> {
        vec![
            EndpointLabel {
                app: "A",
                url: "plaintext://localhost:4000",
            },
            EndpointLabel {
                app: "B",
                url: "plaintext://localhost:4001",
            },
        ]
    }

    #[test]
    fn explicit_app_match_wins() {
        let endpoints = labels();
        let mut counter = 0;

        assert_eq!(route_index(&endpoints, "A", &mut counter), Some(0));
        assert_eq!(route_index(&endpoints, "B", &mut counter), Some(1));
        assert_eq!(counter, 0, "explicit match must not advance the counter");
    }

    #[test]
    fn explicit_url_match_wins() {
        let endpoints = labels();
        let mut counter = 0;

        assert_eq!(
            route_index(&endpoints, "plaintext://localhost:4001", &mut counter),
            Some(1)
        );
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let endpoints = labels();
        let mut counter = 0;

        let first = route_index(&endpoints, "some-key", &mut counter);
        for _ in 0..16 {
            assert_eq!(route_index(&endpoints, "some-key", &mut counter), first);
        }
        assert_eq!(counter, 0, "hash routing must not advance the counter");
    }

    #[test]
    fn round_robin_cycles_through_all_endpoints() {
        let endpoints = labels();
        let mut counter = 0;

        assert_eq!(route_index(&endpoints, "", &mut counter), Some(0));
        assert_eq!(route_index(&endpoints, "", &mut counter), Some(1));
        assert_eq!(route_index(&endpoints, "", &mut counter), Some(0));
    }

    #[test]
    fn round_robin_covers_each_endpoint_within_n_picks() {
        let endpoints = labels();
        let mut counter = 0;
        let mut seen = [false; 2];

        for _ in 0..endpoints.len() {
            let idx = route_index(&endpoints, "", &mut counter).unwrap();
            seen[idx] = true;
        }

        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn counter_wraps_instead_of_resetting() {
        let endpoints = labels();
        let mut counter = u32::MAX;

        // u32::MAX % 2 == 1, then the counter wraps to zero.
        assert_eq!(route_index(&endpoints, "", &mut counter), Some(1));
        assert_eq!(counter, 0);
        assert_eq!(route_index(&endpoints, "", &mut counter), Some(0));
    }

    #[test]
    fn empty_set_yields_nothing() {
        let mut counter = 0;
        assert_eq!(route_index(&[], "anything", &mut counter), None);
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Reference values for the 32-bit FNV-1a parameters.
        assert_eq!(fnv1a_32(b""), 2_166_136_261);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }
}
