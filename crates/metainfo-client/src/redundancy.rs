//! Erasure-coding parameters of a segment.

use serde::{Deserialize, Serialize};

use crate::error::MetainfoError;

/// Erasure code family. Only Reed-Solomon is in use.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedundancyAlgorithm {
    /// Reed-Solomon over GF(2^8).
    #[default]
    ReedSolomon,
}

/// Largest `total` a Reed-Solomon code over GF(2^8) can produce.
pub const MAX_TOTAL_PIECES: u32 = 256;

/// Erasure-coding configuration a segment is created under.
///
/// Valid schemes satisfy `0 < min_required <= repair_threshold <= success_threshold <= total`.
/// A scheme is never changed after a segment has been created with it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Erasure code family.
    pub algorithm: RedundancyAlgorithm,
    /// Number of pieces produced per segment.
    pub total: u32,
    /// Pieces needed to reconstruct the segment.
    pub min_required: u32,
    /// Healthy piece count at or below which the segment needs repair.
    pub repair_threshold: u32,
    /// Pieces that must be stored for an upload to count as successful.
    pub success_threshold: u32,
    /// Size in bytes of each erasure share.
    pub erasure_share_size: u32,
}

impl RedundancyScheme {
    /// Creates a Reed-Solomon scheme. Call [`RedundancyScheme::validate`] before use.
    pub fn new(
        min_required: u32,
        repair_threshold: u32,
        success_threshold: u32,
        total: u32,
        erasure_share_size: u32,
    ) -> Self {
        Self {
            algorithm: RedundancyAlgorithm::ReedSolomon,
            total,
            min_required,
            repair_threshold,
            success_threshold,
            erasure_share_size,
        }
    }

    /// Checks `0 < min_required <= repair_threshold <= success_threshold <= total`
    /// and that `total` fits the code.
    pub fn validate(&self) -> Result<(), MetainfoError> {
        let reason = if self.min_required == 0 {
            "min_required must be positive"
        } else if self.min_required > self.repair_threshold {
            "min_required exceeds repair_threshold"
        } else if self.repair_threshold > self.success_threshold {
            "repair_threshold exceeds success_threshold"
        } else if self.success_threshold > self.total {
            "success_threshold exceeds total"
        } else if self.total > MAX_TOTAL_PIECES {
            "total exceeds 256 pieces"
        } else {
            return Ok(());
        };
        Err(MetainfoError::InvalidRedundancy {
            scheme: *self,
            reason,
        })
    }

    /// Number of pieces a segment under this scheme is split into.
    pub fn piece_count(&self) -> u32 {
        self.total
    }

    /// Bytes of segment data covered by one stripe (one share from each required piece).
    pub fn stripe_size(&self) -> u64 {
        u64::from(self.erasure_share_size) * u64::from(self.min_required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_scheme() {
        let scheme = RedundancyScheme::new(29, 35, 50, 80, 256);
        scheme.validate().unwrap();
        assert_eq!(scheme.piece_count(), 80);
        assert_eq!(scheme.stripe_size(), 29 * 256);
    }

    #[test]
    fn test_reversed_thresholds_rejected() {
        let scheme = RedundancyScheme::new(50, 35, 29, 80, 256);
        let err = scheme.validate().unwrap_err();
        match err {
            MetainfoError::InvalidRedundancy { reason, .. } => {
                assert_eq!(reason, "min_required exceeds repair_threshold")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_min_required_rejected() {
        assert!(RedundancyScheme::new(0, 0, 0, 4, 256).validate().is_err());
    }

    #[test]
    fn test_success_above_total_rejected() {
        assert!(RedundancyScheme::new(2, 3, 5, 4, 256).validate().is_err());
    }

    #[test]
    fn test_total_above_code_limit_rejected() {
        RedundancyScheme::new(1, 1, 1, MAX_TOTAL_PIECES, 256).validate().unwrap();
        let err = RedundancyScheme::new(1, 1, 1, u32::MAX, 256).validate().unwrap_err();
        assert!(matches!(
            err,
            MetainfoError::InvalidRedundancy { reason: "total exceeds 256 pieces", .. }
        ));
    }

    #[test]
    fn test_all_equal_is_valid() {
        RedundancyScheme::new(4, 4, 4, 4, 1).validate().unwrap();
    }

    proptest! {
        #[test]
        fn prop_validate_iff_ordered(
            min in 0u32..20,
            repair in 0u32..20,
            success in 0u32..20,
            total in 0u32..20,
        ) {
            let scheme = RedundancyScheme::new(min, repair, success, total, 256);
            let ordered = 0 < min && min <= repair && repair <= success && success <= total;
            prop_assert_eq!(scheme.validate().is_ok(), ordered);
        }
    }
}
