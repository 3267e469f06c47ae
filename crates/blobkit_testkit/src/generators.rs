//! Property-based test generators using proptest.

use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for generating valid keys.
pub fn arb_key() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9_./-]{1,40}").expect("Invalid regex")
}

/// Strategy for generating non-empty payloads.
pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

/// Strategy for generating valid store names.
pub fn arb_store_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating the contents of one store.
pub fn arb_store_contents(max_entries: usize) -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(arb_key(), arb_payload(), 0..max_entries)
}

/// One store operation.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Write a value.
    Put {
        /// Target key.
        key: String,
        /// Value.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// Target key.
        key: String,
    },
    /// Read a key.
    Get {
        /// Target key.
        key: String,
    },
}

/// Strategy for generating store operations over a small key space, so
/// that puts, deletes and reads collide.
pub fn store_operation_strategy() -> impl Strategy<Value = StoreOperation> {
    let key = || prop::string::string_regex("k[0-9]").expect("Invalid regex");
    prop_oneof![
        3 => (key(), arb_payload()).prop_map(|(key, value)| StoreOperation::Put { key, value }),
        1 => key().prop_map(|key| StoreOperation::Delete { key }),
        2 => key().prop_map(|key| StoreOperation::Get { key }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<StoreOperation>> {
    prop::collection::vec(store_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Fewer cases, for backends that touch the filesystem.
    #[must_use]
    pub fn disk() -> Self {
        Self {
            cases: 24,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generators_produce_valid_values() {
        let mut runner = TestRunner::default();
        for _ in 0..64 {
            let key = arb_key().new_tree(&mut runner).unwrap().current();
            assert!(!key.is_empty());
            let name = arb_store_name().new_tree(&mut runner).unwrap().current();
            assert!(blobkit_storage::validate_store_name(&name).is_ok());
            let payload = arb_payload().new_tree(&mut runner).unwrap().current();
            assert!(!payload.is_empty());
        }
    }
}
