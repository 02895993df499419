//! Property-based tests for tree identifier encoding

use aae::error::CoordinatorError;
use aae::tree_id::{IndexN, PartitionIndex, INDEX_N_LEN};
use proptest::prelude::*;

/// Encoding then decoding preserves the exact (partition, n) pair
#[test]
fn test_index_n_round_trip_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(any::<[u8; 20]>(), 1..=u16::MAX), |(partition, n)| {
            let id = IndexN::new(PartitionIndex::from_bytes(partition), n);
            let decoded = IndexN::decode(&id.encode()).unwrap();
            prop_assert_eq!(decoded, id);
            prop_assert_eq!(decoded.partition.as_bytes(), &partition);
            prop_assert_eq!(decoded.n, n);
            Ok(())
        })
        .unwrap();
}

/// Narrow partition indices widen without changing value
#[test]
fn test_from_parts_accepts_any_narrower_partition() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(any::<u64>(), 1..=u64::from(u16::MAX)), |(partition, n)| {
            let id = IndexN::from_parts(&partition.to_be_bytes(), n).unwrap();
            prop_assert_eq!(id.partition.as_u64(), Some(partition));
            prop_assert_eq!(u64::from(id.n), n);
            prop_assert_eq!(IndexN::decode(&id.encode()).unwrap(), id);
            Ok(())
        })
        .unwrap();
}

/// Anything but a 22-byte pair encoding is rejected
#[test]
fn test_decode_rejects_other_widths() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&proptest::collection::vec(any::<u8>(), 0..64), |bytes| {
            prop_assume!(bytes.len() != INDEX_N_LEN);
            prop_assert!(matches!(
                IndexN::decode(&bytes),
                Err(CoordinatorError::InvalidIdentifier(_))
            ));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_zero_replication_factor_rejected() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&any::<[u8; 20]>(), |partition| {
            let mut encoded = [0u8; INDEX_N_LEN];
            encoded[..20].copy_from_slice(&partition);
            prop_assert!(matches!(
                IndexN::decode(&encoded),
                Err(CoordinatorError::InvalidIdentifier(_))
            ));
            Ok(())
        })
        .unwrap();
}

/// Identifier order agrees with the order of the encoded bytes
#[test]
fn test_order_matches_encoding_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    let id = (any::<[u8; 20]>(), 1..=u16::MAX)
        .prop_map(|(p, n)| IndexN::new(PartitionIndex::from_bytes(p), n));

    runner
        .run(&(id.clone(), id), |(a, b)| {
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
            Ok(())
        })
        .unwrap();
}
