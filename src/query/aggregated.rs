//! Plans fanning out over the concrete entities of a polymorphic statement.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::query::options::Limit;
use crate::query::select::{ScrollMode, ScrollableResults};
use crate::query::spi::{ExecutionContext, NonSelectQueryPlan, SelectQueryPlan};
use crate::types::{PlanError, Result};

/// Select over several concrete plans with a shared row window.
///
/// Sub-plans run without a window, in order, and only until the window is
/// filled.
pub struct AggregatedSelectPlan<R> {
    plans: Vec<Arc<dyn SelectQueryPlan<R>>>,
}

impl<R> AggregatedSelectPlan<R> {
    /// Aggregates `plans` in the given order.
    pub fn new(plans: Vec<Arc<dyn SelectQueryPlan<R>>>) -> Self {
        Self { plans }
    }

    /// Sub-plans in execution order.
    pub fn plans(&self) -> &[Arc<dyn SelectQueryPlan<R>>] {
        &self.plans
    }
}

/// Slices the window `limit` out of the concatenation of the lists produced
/// by `fetch`, calling it only until the window is filled.
pub fn collect_window<R, F>(limit: Limit, partitions: usize, mut fetch: F) -> Result<Vec<R>>
where
    F: FnMut(usize) -> Result<Vec<R>>,
{
    let max_rows = limit.max_rows.map(|max| max as usize);
    if max_rows == Some(0) {
        return Ok(Vec::new());
    }
    let mut skip = limit.skip() as usize;
    let mut results = Vec::new();
    for partition in 0..partitions {
        let mut list = fetch(partition)?;
        let size = list.len();
        if size <= skip {
            trace!(partition, size, skip, "plan.aggregated.skip_partition");
            skip -= size;
            continue;
        }
        if let Some(max) = max_rows {
            if size + results.len() - skip >= max {
                let take = max - results.len();
                trace!(partition, skip, take, "plan.aggregated.fill_window");
                results.extend(list.drain(skip..skip + take));
                break;
            }
        }
        if skip > 0 {
            results.extend(list.drain(skip..));
            skip = 0;
        } else {
            results.append(&mut list);
        }
    }
    Ok(results)
}

impl<R: Send + Sync> SelectQueryPlan<R> for AggregatedSelectPlan<R> {
    fn perform_list(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<R>> {
        let limit = ctx.options.limit;
        let unlimited = ctx.options.without_limit();
        let sub_ctx = ctx.with_options(&unlimited);
        let results = collect_window(limit, self.plans.len(), |idx| {
            self.plans[idx].perform_list(&sub_ctx)
        })?;
        debug!(
            partitions = self.plans.len(),
            rows = results.len(),
            "plan.aggregated.list"
        );
        Ok(results)
    }

    fn perform_scroll(
        &self,
        mode: ScrollMode,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ScrollableResults<R>> {
        if ctx.options.limit.max_rows == Some(0) {
            return Ok(ScrollableResults::empty(mode));
        }
        warn!(partitions = self.plans.len(), "plan.aggregated.scroll_unsupported");
        Err(PlanError::Unsupported(
            "scrolling over a polymorphic query spanning several entities",
        ))
    }

    fn execute_query(
        &self,
        _ctx: &ExecutionContext<'_>,
        _consumer: &mut dyn FnMut(R) -> Result<()>,
    ) -> Result<()> {
        Err(PlanError::Unsupported(
            "streaming a polymorphic query spanning several entities",
        ))
    }
}

/// Mutation over several concrete plans; the counts are summed.
pub struct AggregatedMutationPlan {
    plans: Vec<Arc<dyn NonSelectQueryPlan>>,
}

impl AggregatedMutationPlan {
    /// Aggregates `plans` in the given order.
    pub fn new(plans: Vec<Arc<dyn NonSelectQueryPlan>>) -> Self {
        Self { plans }
    }

    /// Sub-plans in execution order.
    pub fn plans(&self) -> &[Arc<dyn NonSelectQueryPlan>] {
        &self.plans
    }
}

impl NonSelectQueryPlan for AggregatedMutationPlan {
    fn execute_update(&self, ctx: &ExecutionContext<'_>) -> Result<u64> {
        let mut total = 0u64;
        for plan in &self.plans {
            total += plan.execute_update(ctx)?;
        }
        debug!(partitions = self.plans.len(), total, "plan.aggregated.update");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(sizes: &[usize]) -> Vec<Vec<(usize, usize)>> {
        sizes
            .iter()
            .enumerate()
            .map(|(p, size)| (0..*size).map(|i| (p, i)).collect())
            .collect()
    }

    #[test]
    fn window_spans_partitions() {
        let data = partitions(&[5, 3, 4]);
        let mut fetched = Vec::new();
        let rows = collect_window(Limit::new(Some(6), Some(4)), data.len(), |idx| {
            fetched.push(idx);
            Ok(data[idx].clone())
        })
        .expect("window");
        assert_eq!(rows, vec![(1, 1), (1, 2), (2, 0), (2, 1)]);
        assert_eq!(fetched, vec![0, 1, 2]);
    }

    #[test]
    fn filled_window_stops_fetching() {
        let data = partitions(&[5, 3, 4]);
        let mut fetched = Vec::new();
        let rows = collect_window(Limit::new(None, Some(2)), data.len(), |idx| {
            fetched.push(idx);
            Ok(data[idx].clone())
        })
        .expect("window");
        assert_eq!(rows, vec![(0, 0), (0, 1)]);
        assert_eq!(fetched, vec![0]);
    }

    #[test]
    fn zero_max_rows_fetches_nothing() {
        let rows: Vec<u8> = collect_window(Limit::new(Some(3), Some(0)), 4, |_| {
            panic!("no partition may be fetched")
        })
        .expect("window");
        assert!(rows.is_empty());
    }

    #[test]
    fn unbounded_window_skips_then_concatenates() {
        let data = partitions(&[2, 2]);
        let rows = collect_window(Limit::new(Some(3), None), data.len(), |idx| {
            Ok(data[idx].clone())
        })
        .expect("window");
        assert_eq!(rows, vec![(1, 1)]);
    }
}
