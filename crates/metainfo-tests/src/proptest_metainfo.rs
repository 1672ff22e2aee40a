//! Property-based tests over schemes, piece layouts and listing.

use metainfo_client::{NodeId, RedundancyScheme, RemotePiece};
use proptest::prelude::*;

/// Arbitrary four thresholds in `1..=100`, not necessarily ordered.
pub fn arb_scheme() -> impl Strategy<Value = RedundancyScheme> {
    (0u32..100, 0u32..100, 0u32..100, 0u32..100, prop_oneof![Just(256u32), Just(1024), Just(2048)])
        .prop_map(|(m, r, s, t, share)| RedundancyScheme::new(m, r, s, t, share))
}

/// A distinct node per index.
pub fn node(i: u32) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&i.to_be_bytes());
    bytes[31] = 0xA5;
    NodeId::new(bytes)
}

/// A `total` and a valid sparse piece layout below it.
pub fn arb_piece_layout() -> impl Strategy<Value = (u32, Vec<RemotePiece>)> {
    (1u32..64).prop_flat_map(|total| {
        (
            Just(total),
            proptest::collection::btree_set(0..total, 0..=total as usize),
        )
            .prop_map(|(total, numbers)| {
                let pieces = numbers
                    .into_iter()
                    .map(|n| RemotePiece::new(n, node(n + 1000)))
                    .collect();
                (total, pieces)
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{small_scheme, upload, TestEnv};
    use metainfo_client::{
        align, Context, ListOptions, MetainfoError, PieceAction, PieceAuthorization, PieceId,
        Pointer, PointerViolation, SegmentLocator, Timestamp,
    };
    use std::collections::BTreeSet;

    fn authorization_for(piece: &RemotePiece) -> PieceAuthorization {
        PieceAuthorization {
            piece_number: piece.piece_number,
            storage_node_id: piece.node_id,
            piece_id: PieceId::random(),
            action: PieceAction::Get,
            serial_number: [7; 16],
            limit_token: Vec::new(),
            expires_at: Timestamp::from_secs(u64::MAX / 2),
            address: None,
        }
    }

    proptest! {
        #[test]
        fn prop_scheme_valid_iff_ordered(scheme in arb_scheme()) {
            let ordered = 0 < scheme.min_required
                && scheme.min_required <= scheme.repair_threshold
                && scheme.repair_threshold <= scheme.success_threshold
                && scheme.success_threshold <= scheme.total;
            match scheme.validate() {
                Ok(()) => prop_assert!(ordered),
                Err(MetainfoError::InvalidRedundancy { scheme: rejected, .. }) => {
                    prop_assert!(!ordered);
                    prop_assert_eq!(rejected, scheme);
                }
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }

        #[test]
        fn prop_aligned_slot_present_iff_authorized(
            (total, pieces) in arb_piece_layout(),
            keep in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let authorized: Vec<RemotePiece> = pieces
                .iter()
                .zip(keep.iter())
                .filter(|(_, k)| **k)
                .map(|(p, _)| *p)
                .collect();
            let mut auths: Vec<PieceAuthorization> =
                authorized.iter().map(authorization_for).collect();
            auths.reverse();

            let aligned = align(auths, &pieces, total).unwrap();
            prop_assert_eq!(aligned.len(), total as usize);
            prop_assert_eq!(aligned.present(), authorized.len());

            let wanted: BTreeSet<u32> = authorized.iter().map(|p| p.piece_number).collect();
            for n in 0..total {
                match aligned.get(n as usize) {
                    Some(auth) => {
                        prop_assert!(wanted.contains(&n));
                        prop_assert_eq!(auth.piece_number, n);
                        prop_assert_eq!(auth.storage_node_id, node(n + 1000));
                    }
                    None => prop_assert!(!wanted.contains(&n)),
                }
            }
        }

        #[test]
        fn prop_duplicate_piece_is_malformed(
            (total, pieces) in arb_piece_layout(),
            pick in any::<prop::sample::Index>(),
        ) {
            prop_assume!(!pieces.is_empty());
            let dup = pieces[pick.index(pieces.len())];
            let mut corrupt = pieces.clone();
            corrupt.push(RemotePiece::new(dup.piece_number, node(9999)));

            let scheme = RedundancyScheme::new(1, 1, 1, total, 256);
            let pointer = Pointer::new(1, scheme, PieceId::random(), corrupt.clone());
            prop_assert!(matches!(
                pointer.validate(),
                Err(MetainfoError::MalformedPointer(PointerViolation::DuplicatePiece { piece_number }))
                    if piece_number == dup.piece_number
            ), "expected duplicate piece {}", dup.piece_number);
            prop_assert_eq!(
                align(Vec::new(), &corrupt, total).unwrap_err(),
                PointerViolation::DuplicatePiece { piece_number: dup.piece_number }
            );
        }

        #[test]
        fn prop_out_of_range_piece_is_malformed(total in 1u32..64, over in 0u32..16) {
            let pieces = vec![RemotePiece::new(total + over, node(1))];
            prop_assert!(matches!(
                align(Vec::new(), &pieces, total),
                Err(PointerViolation::PieceOutOfRange { .. })
            ), "expected piece {} out of range", total + over);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_paged_listing_visits_every_path_once(
            names in proptest::collection::btree_set("[a-c]{1,3}(/[a-c]{1,2})?", 1..24),
            limit in 1u32..6,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let listed = rt.block_on(async {
                let env = TestEnv::new(5).await;
                let client = env.client();
                let ctx = Context::background();
                for name in &names {
                    let loc = SegmentLocator::last("prop", name.as_bytes().to_vec());
                    upload(&client, &ctx, &loc, &small_scheme()).await.unwrap();
                }

                let mut listed = Vec::new();
                let mut cursor = Vec::new();
                loop {
                    let page = client
                        .list_segments(
                            &ctx,
                            "prop",
                            ListOptions::new("").recursive(true).limit(limit).start_after(cursor.clone()),
                        )
                        .await
                        .unwrap();
                    assert!(page.items.len() <= limit as usize);
                    listed.extend(page.items.iter().map(|i| String::from_utf8(i.path.clone()).unwrap()));
                    match page.next_cursor() {
                        Some(next) => cursor = next.to_vec(),
                        None => break,
                    }
                }
                listed
            });

            let expected: Vec<String> = names.into_iter().collect();
            prop_assert_eq!(listed, expected);
        }
    }
}
