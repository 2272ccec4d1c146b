//! Proptest strategies for key-value workloads.
//!
//! Reusable generators for property-based testing across crates. Keys are
//! drawn from a small alphabet so that generated operation sequences revisit
//! the same keys often enough to exercise overwrite and delete paths.
//!
//! # Usage
//!
//! ```no_run
//! use kvs_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_op_sequence()) {
//!         // apply ops to the store and to a model, compare
//!     }
//! }
//! ```

use proptest::prelude::*;

/// One step of a generated key-value workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Store `value` under `key`.
    Put {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes, never empty.
        value: Vec<u8>,
    },
    /// Delete `key`, which may be absent.
    Delete {
        /// Key bytes.
        key: Vec<u8>,
    },
    /// Look up `key`.
    Get {
        /// Key bytes.
        key: Vec<u8>,
    },
}

/// Generates a key of 1-8 bytes matching `[a-h]{1,8}`.
pub fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    "[a-h]{1,8}".prop_map(String::into_bytes)
}

/// Generates an arbitrary binary key of 1-64 bytes.
pub fn arb_binary_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..65)
}

/// Generates a non-empty value of 1-128 random bytes.
pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..129)
}

/// Generates a value of 1-8192 bytes, large enough to spill into overflow
/// pages at small page sizes.
pub fn arb_large_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..8193)
}

/// Generates one [`KvOp`], weighted towards puts.
pub fn arb_op() -> impl Strategy<Value = KvOp> {
    prop_oneof![
        5 => (arb_key(), prop_oneof![4 => arb_value(), 1 => arb_large_value()])
            .prop_map(|(key, value)| KvOp::Put { key, value }),
        2 => arb_key().prop_map(|key| KvOp::Delete { key }),
        1 => arb_key().prop_map(|key| KvOp::Get { key }),
    ]
}

/// Generates a sequence of 1-200 operations.
pub fn arb_op_sequence() -> impl Strategy<Value = Vec<KvOp>> {
    proptest::collection::vec(arb_op(), 1..200)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn strategy_produces_non_empty_keys_and_values(op in arb_op()) {
            match &op {
                KvOp::Put { key, value } => {
                    prop_assert!(!key.is_empty());
                    prop_assert!(!value.is_empty());
                }
                KvOp::Delete { key } | KvOp::Get { key } => prop_assert!(!key.is_empty()),
            }
        }

        #[test]
        fn strategy_keys_stay_in_alphabet(key in arb_key()) {
            prop_assert!(key.iter().all(|b| (b'a'..=b'h').contains(b)));
        }

        #[test]
        fn strategy_produces_non_empty_sequences(ops in arb_op_sequence()) {
            prop_assert!(!ops.is_empty());
        }
    }
}
