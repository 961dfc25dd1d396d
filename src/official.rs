//! Official-Entity Meshing
//!
//! Official (treasury) holders live in a reserved id range `[min, max]` cut
//! into buckets of `step` ids. Callers address an official holder by its
//! bucket boundary (a multiple of `step`); before execution the engine
//! rewrites it to one of the `step` sub-rows of that bucket, chosen by the
//! first ordinary participant:
//!
//! ```text
//! meshed = bucket - step + (ordinary_holder mod step)
//! ```
//!
//! The same ordinary participant always lands on the same sub-row, so a
//! retried transfer touches exactly the rows the first attempt touched.
//!
//! `min - 1` must be a multiple of `step`, so that every sub-row of every
//! bucket stays inside `[min, max]` and keeps its official exemptions.

use crate::config::{ConfigError, EngineConfig};
use crate::core_types::HolderId;
use crate::transfer::types::{TransferLeg, TransferRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfficialRange {
    step: i64,
    min: i64,
    max: i64,
}

impl OfficialRange {
    pub fn new(step: i64, min: i64, max: i64) -> Result<Self, ConfigError> {
        if step <= 0 {
            return Err(ConfigError::InvalidOfficialStep(step));
        }
        if min < 1 || min > max || max < step {
            return Err(ConfigError::InvalidOfficialRange { min, max, step });
        }
        if (min - 1) % step != 0 {
            return Err(ConfigError::MisalignedOfficialMin { min, step });
        }
        Ok(Self { step, min, max })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Self::new(config.official_step, config.official_min, config.official_max)
    }

    #[inline]
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Whether `holder_id` is an official holder (bucket or meshed sub-row)
    #[inline]
    pub fn contains(&self, holder_id: HolderId) -> bool {
        holder_id >= self.min && holder_id <= self.max
    }

    /// Whether a caller-supplied official id is a valid bucket selector
    #[inline]
    pub fn is_bucket(&self, holder_id: HolderId) -> bool {
        holder_id % self.step == 0
    }

    #[inline]
    pub fn remainder(&self, holder_id: HolderId) -> i64 {
        holder_id % self.step
    }

    /// Map a bucket id to its sub-row. Remainder 0 keeps the bucket id itself.
    #[inline]
    pub fn mesh(&self, official_id: HolderId, remainder: i64) -> HolderId {
        if remainder == 0 {
            return official_id;
        }
        official_id - self.step + remainder
    }

    /// Rewrite every official participant of `req` in place.
    ///
    /// No-op when all participants are official.
    pub fn mesh_request(&self, req: &mut TransferRequest) {
        let Some(remainder) = self.first_ordinary_remainder(req) else {
            return;
        };

        let rewrite = |legs: &mut [TransferLeg]| {
            for leg in legs.iter_mut() {
                if self.contains(leg.holder_id) {
                    leg.holder_id = self.mesh(leg.holder_id, remainder);
                }
            }
        };
        rewrite(&mut req.from);
        rewrite(&mut req.to);
    }

    fn first_ordinary_remainder(&self, req: &TransferRequest) -> Option<i64> {
        req.from
            .iter()
            .chain(req.to.iter())
            .find(|leg| !self.contains(leg.holder_id))
            .map(|leg| self.remainder(leg.holder_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> OfficialRange {
        OfficialRange::new(1000, 1, 1_000_000).unwrap()
    }

    fn request(from: Vec<TransferLeg>, to: Vec<TransferLeg>) -> TransferRequest {
        TransferRequest::new(1, 1, from, to)
    }

    #[test]
    fn test_membership_and_buckets() {
        let r = range();
        assert!(r.contains(1));
        assert!(r.contains(1_000_000));
        assert!(!r.contains(0));
        assert!(!r.contains(1_000_001));

        assert!(r.is_bucket(2000));
        assert!(!r.is_bucket(2001));
    }

    #[test]
    fn test_mesh_formula() {
        let r = range();
        assert_eq!(r.mesh(2000, 7), 1007);
        assert_eq!(r.mesh(2000, 0), 2000);
        // stays inside the bucket
        assert!(r.mesh(2000, 999) > 1000 && r.mesh(2000, 999) < 2000);
    }

    #[test]
    fn test_mesh_request_uses_first_ordinary_holder() {
        let r = range();
        let mut req = request(
            vec![TransferLeg::new(2000, 1, 10, 1)],
            vec![
                TransferLeg::new(5_000_042, 1, 9, 2),
                TransferLeg::new(3000, 1, 1, 3),
            ],
        );
        r.mesh_request(&mut req);

        assert_eq!(req.from[0].holder_id, 1042);
        assert_eq!(req.to[0].holder_id, 5_000_042);
        assert_eq!(req.to[1].holder_id, 2042);
    }

    #[test]
    fn test_mesh_is_deterministic() {
        let r = range();
        let build = || {
            request(
                vec![TransferLeg::new(7_000_123, 1, 5, 1)],
                vec![TransferLeg::new(4000, 1, 5, 2)],
            )
        };
        let mut first = build();
        let mut second = build();
        r.mesh_request(&mut first);
        r.mesh_request(&mut second);
        assert_eq!(first.to[0].holder_id, second.to[0].holder_id);
        assert_eq!(first.to[0].holder_id, 3123);
    }

    #[test]
    fn test_all_official_left_untouched() {
        let r = range();
        let mut req = request(
            vec![TransferLeg::new(1000, 1, 5, 1)],
            vec![TransferLeg::new(2000, 1, 5, 2)],
        );
        r.mesh_request(&mut req);
        assert_eq!(req.from[0].holder_id, 1000);
        assert_eq!(req.to[0].holder_id, 2000);
    }

    #[test]
    fn test_invalid_range() {
        assert!(OfficialRange::new(0, 1, 10).is_err());
        assert!(OfficialRange::new(100, 1, 10).is_err());
        assert!(OfficialRange::new(10, 0, 100).is_err());
    }

    #[test]
    fn test_misaligned_min_rejected() {
        // bucket 1000 would mesh onto ordinary ids 1..999
        assert_eq!(
            OfficialRange::new(1000, 1000, 1_000_000),
            Err(ConfigError::MisalignedOfficialMin {
                min: 1000,
                step: 1000
            })
        );
        assert_eq!(
            OfficialRange::new(1000, 500, 1_000_000),
            Err(ConfigError::MisalignedOfficialMin {
                min: 500,
                step: 1000
            })
        );
        assert!(OfficialRange::new(1000, 1001, 1_000_000).is_ok());
    }

    #[test]
    fn test_meshed_rows_stay_official() {
        let r = OfficialRange::new(1000, 1001, 1_000_000).unwrap();
        // below min, so an ordinary holder
        assert!(!r.contains(1000));

        for bucket in [2000, 3000, 1_000_000] {
            for remainder in [0, 1, 500, 999] {
                let meshed = r.mesh(bucket, remainder);
                assert!(r.contains(meshed), "{meshed} left the official range");
            }
        }
    }
}
