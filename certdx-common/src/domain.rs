//! Order-independent domain-set fingerprinting and allow-list matching
//! (spec §4.1), ported from `utils.DomainsAsKey`/`utils.IsSubdomain`.

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Order-independent 64-bit fingerprint of a domain set: wrapping sum of
/// the FNV-1a hash of each name. Zero only for an empty set, which callers
/// must reject before reaching the cache.
pub fn key(domains: &[String]) -> u64 {
    domains.iter().fold(0u64, |acc, d| acc.wrapping_add(fnv1a64(d.as_bytes())))
}

/// `true` iff `domain` equals, or is a DNS-suffix child of, some entry in `allow_list`.
pub fn allowed(domain: &str, allow_list: &[String]) -> bool {
    allow_list.iter().any(|a| domain == a || domain.ends_with(&format!(".{a}")))
}

/// `true` iff every name in `domains` is allowed.
pub fn domains_allowed(domains: &[String], allow_list: &[String]) -> bool {
    !domains.is_empty() && domains.iter().all(|d| allowed(d, allow_list))
}

/// Set equality for two domain lists, independent of ordering or duplicates.
pub fn same_domain_set(a: &[String], b: &[String]) -> bool {
    let mut a_sorted: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b_sorted: Vec<&str> = b.iter().map(String::as_str).collect();
    a_sorted.sort_unstable();
    b_sorted.sort_unstable();
    a_sorted.dedup();
    b_sorted.dedup();
    a_sorted == b_sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_independent() {
        let a = vec!["a.example.com".to_string(), "b.example.com".to_string()];
        let b = vec!["b.example.com".to_string(), "a.example.com".to_string()];
        assert_eq!(key(&a), key(&b));
    }

    #[test]
    fn allowed_matches_exact_and_suffix() {
        let list = vec!["example.com".to_string()];
        assert!(allowed("example.com", &list));
        assert!(allowed("a.example.com", &list));
        assert!(!allowed("notexample.com", &list));
        assert!(!allowed("example.com.evil.com", &list));
    }

    #[test]
    fn empty_domain_set_is_not_allowed() {
        assert!(!domains_allowed(&[], &["example.com".to_string()]));
    }

    #[test]
    fn same_domain_set_ignores_order() {
        let a = vec!["b.com".to_string(), "a.com".to_string()];
        let b = vec!["a.com".to_string(), "b.com".to_string()];
        assert!(same_domain_set(&a, &b));
    }
}
