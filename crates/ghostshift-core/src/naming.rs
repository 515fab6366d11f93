//! Allocation of generated database object names.
//!
//! Ghost tables, sync functions, triggers, migrator functions and versions all get
//! generated names. Allocation is a capability handed to whoever needs it, so tests
//! can substitute a deterministic sequence.

use rand::Rng;

const ALPHABET: &[u8] = b"abcdefgh0123456789";
const TOKEN_LENGTH: usize = 7;

/// Prefix for ghost table ref ids.
pub const TABLE_PREFIX: &str = "table_";
/// Prefix for sync trigger functions.
pub const SYNC_FUNCTION_PREFIX: &str = "sync_";
/// Prefix for sync triggers.
pub const TRIGGER_PREFIX: &str = "trig_";
/// Prefix for batched migrator functions.
pub const MIGRATOR_PREFIX: &str = "migrator_";
/// Prefix for sequences owned by ghost tables.
pub const SEQUENCE_PREFIX: &str = "seq_";

/// Source of unique generated names.
pub trait NameAllocator {
    /// Produce a fresh candidate token.
    fn next_token(&mut self) -> String;

    /// Allocate `prefix` + token, retrying while `is_taken` reports a collision.
    fn allocate(&mut self, prefix: &str, is_taken: &dyn Fn(&str) -> bool) -> String {
        loop {
            let candidate = format!("{}{}", prefix, self.next_token());
            if !is_taken(&candidate) {
                return candidate;
            }
        }
    }
}

/// Random short tokens, 7 characters from a restricted alphabet.
#[derive(Debug, Default)]
pub struct RandomNameAllocator;

impl RandomNameAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl NameAllocator for RandomNameAllocator {
    fn next_token(&mut self) -> String {
        let mut rng = rand::thread_rng();
        (0..TOKEN_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

/// Deterministic counter-based tokens.
#[derive(Debug, Default)]
pub struct SequentialNameAllocator {
    counter: u64,
}

impl SequentialNameAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameAllocator for SequentialNameAllocator {
    fn next_token(&mut self) -> String {
        self.counter += 1;
        self.counter.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_shape() {
        let mut names = RandomNameAllocator::new();
        let token = names.next_token();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_allocate_skips_taken_names() {
        let mut names = SequentialNameAllocator::new();
        let taken = ["sync_1", "sync_2"];
        let name = names.allocate(SYNC_FUNCTION_PREFIX, &|candidate| taken.contains(&candidate));
        assert_eq!(name, "sync_3");
    }
}
