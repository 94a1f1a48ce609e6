//! Batch sizing.
//!
//! The plan is a pure function of the row count and [`BatchLimits`]; reruns
//! rely on getting the exact same row ranges back, so nothing here may depend
//! on time, randomness or file contents beyond the row count.

use std::ops::Range;

use crate::config::BatchLimits;
use crate::error::{PipelineError, Result};

/// Which of the three constraints produced the effective limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingConstraint {
    RequestCount,
    FileSize,
    TokenQuota,
}

impl std::fmt::Display for BindingConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BindingConstraint::RequestCount => "max requests per batch",
            BindingConstraint::FileSize => "file size",
            BindingConstraint::TokenQuota => "enqueued token quota",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    pub total_records: usize,
    pub limit_by_requests: usize,
    pub limit_by_size: usize,
    pub limit_by_tokens: usize,
    pub effective_limit: usize,
    pub binding: BindingConstraint,
    pub batch_count: usize,
    pub records_per_batch: usize,
}

impl BatchPlan {
    /// Compute the plan for `total_records` rows.
    pub fn compute(total_records: usize, limits: &BatchLimits) -> Result<Self> {
        if !(limits.est_bytes_per_request > 0.0) || !(limits.est_tokens_per_request > 0.0) {
            return Err(PipelineError::InvalidLimits(
                "per-request byte and token estimates must be positive".into(),
            ));
        }
        let limit_by_requests = limits.max_requests_per_batch;
        let limit_by_size = (limits.max_file_bytes as f64 / limits.est_bytes_per_request).floor() as usize;
        let limit_by_tokens =
            (limits.max_enqueued_tokens as f64 / limits.est_tokens_per_request).floor() as usize;

        // ties keep the earlier constraint
        let (effective_limit, binding) = [
            (limit_by_size, BindingConstraint::FileSize),
            (limit_by_tokens, BindingConstraint::TokenQuota),
        ]
        .into_iter()
        .fold(
            (limit_by_requests, BindingConstraint::RequestCount),
            |best, candidate| if candidate.0 < best.0 { candidate } else { best },
        );

        if effective_limit == 0 {
            return Err(PipelineError::InvalidLimits(format!(
                "{binding} allows zero requests per batch"
            )));
        }

        let batch_count = total_records.div_ceil(effective_limit);
        let records_per_batch = if batch_count == 0 { 0 } else { total_records / batch_count };

        Ok(Self {
            total_records,
            limit_by_requests,
            limit_by_size,
            limit_by_tokens,
            effective_limit,
            binding,
            batch_count,
            records_per_batch,
        })
    }

    /// Row range of 1-based batch `n`; the last batch absorbs the remainder.
    pub fn range(&self, n: usize) -> Range<usize> {
        assert!(n >= 1 && n <= self.batch_count, "batch {n} out of 1..={}", self.batch_count);
        let start = (n - 1) * self.records_per_batch;
        let end = if n == self.batch_count {
            self.total_records
        } else {
            start + self.records_per_batch
        };
        start..end
    }

    pub fn ranges(&self) -> impl Iterator<Item = (usize, Range<usize>)> + '_ {
        (1..=self.batch_count).map(move |n| (n, self.range(n)))
    }

    /// Row count of the largest (last) batch.
    pub fn largest_batch(&self) -> usize {
        if self.batch_count == 0 {
            0
        } else {
            self.range(self.batch_count).len()
        }
    }

    /// Human-readable sizing report, one line per fact.
    pub fn describe(&self, limits: &BatchLimits) -> Vec<String> {
        let total_tokens = self.total_records as f64 * limits.est_tokens_per_request;
        let mb_per_batch =
            self.records_per_batch as f64 * limits.est_bytes_per_request / (1024.0 * 1024.0);
        let mut lines = vec![
            format!("total records:               {}", self.total_records),
            format!("limit by request count:      {}", self.limit_by_requests),
            format!("limit by file size:          {}", self.limit_by_size),
            format!("limit by enqueued tokens:    {}", self.limit_by_tokens),
            format!("effective limit:             {} ({})", self.effective_limit, self.binding),
            format!("batches:                     {}", self.batch_count),
            format!("records per batch:           ~{}", self.records_per_batch),
            format!("estimated size per batch:    ~{mb_per_batch:.1} MB"),
            format!(
                "estimated tokens per batch:  ~{:.0}",
                self.records_per_batch as f64 * limits.est_tokens_per_request
            ),
            format!(
                "total tokens:                ~{total_tokens:.0} ({:.1}% of quota)",
                total_tokens / limits.max_enqueued_tokens.max(1) as f64 * 100.0
            ),
        ];
        if self.largest_batch() > self.effective_limit {
            lines.push(format!(
                "warning: last batch holds {} records, above the effective limit",
                self.largest_batch()
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits(max_requests: usize) -> BatchLimits {
        BatchLimits {
            max_requests_per_batch: max_requests,
            ..BatchLimits::default()
        }
    }

    #[test]
    fn default_limits_bind_on_file_size() {
        let plan = BatchPlan::compute(150_000, &BatchLimits::default()).unwrap();
        // 100 MiB / 12 KiB
        assert_eq!(plan.limit_by_size, 8_533);
        assert_eq!(plan.limit_by_tokens, 294_117);
        assert_eq!(plan.binding, BindingConstraint::FileSize);
        assert_eq!(plan.batch_count, 18);
        assert_eq!(plan.records_per_batch, 8_333);
        assert_eq!(plan.range(18), 141_661..150_000);
    }

    #[test]
    fn remainder_goes_to_the_last_batch() {
        let plan = BatchPlan::compute(27, &limits(10)).unwrap();
        assert_eq!(plan.batch_count, 3);
        let ranges: Vec<_> = plan.ranges().map(|(_, r)| r).collect();
        assert_eq!(ranges, vec![0..9, 9..18, 18..27]);

        let plan = BatchPlan::compute(23, &limits(10)).unwrap();
        let sizes: Vec<_> = plan.ranges().map(|(_, r)| r.len()).collect();
        assert_eq!(sizes, vec![7, 7, 9]);
    }

    #[test]
    fn empty_dataset_has_no_batches() {
        let plan = BatchPlan::compute(0, &limits(10)).unwrap();
        assert_eq!(plan.batch_count, 0);
        assert_eq!(plan.ranges().count(), 0);
    }

    #[test]
    fn zero_effective_limit_is_rejected() {
        let mut l = BatchLimits::default();
        l.est_bytes_per_request = (l.max_file_bytes + 1) as f64;
        assert!(matches!(
            BatchPlan::compute(5, &l),
            Err(PipelineError::InvalidLimits(_))
        ));
        l.est_bytes_per_request = 0.0;
        assert!(BatchPlan::compute(5, &l).is_err());
    }

    #[test]
    fn token_quota_can_bind() {
        let l = BatchLimits {
            max_enqueued_tokens: 34_000,
            ..BatchLimits::default()
        };
        let plan = BatchPlan::compute(25, &l).unwrap();
        assert_eq!(plan.binding, BindingConstraint::TokenQuota);
        assert_eq!(plan.effective_limit, 10);
    }

    proptest! {
        #[test]
        fn sizes_sum_to_total_and_only_last_differs(n in 0usize..20_000, max in 1usize..5_000) {
            let plan = BatchPlan::compute(n, &limits(max)).unwrap();
            let sizes: Vec<usize> = plan.ranges().map(|(_, r)| r.len()).collect();
            prop_assert_eq!(sizes.iter().sum::<usize>(), n);
            prop_assert_eq!(sizes.len(), n.div_ceil(plan.effective_limit));
            if let Some((_, head)) = sizes.split_last() {
                prop_assert!(head.iter().all(|s| *s == plan.records_per_batch));
            }
            // contiguous, non-overlapping
            let mut next = 0;
            for (_, r) in plan.ranges() {
                prop_assert_eq!(r.start, next);
                next = r.end;
            }
        }

        #[test]
        fn plan_is_deterministic(n in 0usize..100_000, max in 1usize..60_000) {
            let a = BatchPlan::compute(n, &limits(max)).unwrap();
            let b = BatchPlan::compute(n, &limits(max)).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
