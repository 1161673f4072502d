use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a process-unique session key like `FLVSUB1`, `FLVSUB2`, ...
/// The numeric part is shared across all prefixes.
pub fn gen_unique_key(prefix: &str) -> String {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}{}", prefix, id)
}

#[cfg(test)]
mod tests {
    use super::gen_unique_key;

    #[test]
    fn test_prefix_is_kept() {
        let key = gen_unique_key("FLVSUB");
        assert!(key.starts_with("FLVSUB"));
        assert!(key["FLVSUB".len()..].parse::<u64>().is_ok());
    }

    #[test]
    fn test_keys_never_repeat() {
        let a = gen_unique_key("GROUP");
        let b = gen_unique_key("GROUP");
        let c = gen_unique_key("FLVPUSH");
        assert_ne!(a, b);
        assert_ne!(b, c);
    }
}
