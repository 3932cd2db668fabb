//! Human-legible sub-agent ids: a kebab-case prefix lifted from the spec's
//! description (or prompt), suffixed with a short hash for uniqueness so
//! two sub-agents started from the same description never collide.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub fn spec_id(seed: &str, salt: u64) -> String {
    let words: Vec<String> = seed
        .split_whitespace()
        .filter(|w| w.len() > 1)
        .take(4)
        .map(|w| w.to_lowercase().chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| !w.is_empty())
        .collect();

    let mut prefix = if words.is_empty() { "sub".to_string() } else { words.join("-") };
    if prefix.len() > 24 {
        prefix.truncate(24);
    }

    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    salt.hash(&mut hasher);
    let hash = hasher.finish();

    format!("{prefix}-{:05x}", hash & 0xFFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_seed_falls_back_to_sub_prefix() {
        let id = spec_id("", 0);
        assert!(id.starts_with("sub-"));
    }

    #[test]
    fn same_seed_different_salt_differs() {
        let a = spec_id("fix the parser", 0);
        let b = spec_id("fix the parser", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn long_seed_is_truncated() {
        let id = spec_id("this is a very long description that exceeds the prefix budget by a lot", 0);
        let prefix = id.rsplit_once('-').unwrap().0;
        assert!(prefix.len() <= 24);
    }
}
