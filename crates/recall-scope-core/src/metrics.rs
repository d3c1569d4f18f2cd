use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::graph::{usize_to_f64, LineageGraph};
use crate::model::{ContaminationEvent, UnitId, UnitKind};
use crate::resolve::{source_position, validate_dilution_threshold};
use crate::RecallError;

/// Distribution units truly contaminated by `event`.
///
/// Computed by walking each distribution unit's ancestry backwards with memoized
/// contaminated fractions, independently of the forward traversal used for recall.
///
/// # Errors
/// Returns [`RecallError::Resolution`] for an unknown or non-source event unit, or for a
/// dilution threshold outside `[0, 1]`.
pub fn ground_truth(
    graph: &LineageGraph,
    event: &ContaminationEvent,
    dilution_threshold: f64,
) -> Result<BTreeSet<UnitId>, RecallError> {
    validate_dilution_threshold(dilution_threshold)?;
    let source = source_position(graph, event)?;

    let mut fractions: Vec<Option<f64>> = vec![None; graph.len()];
    fractions[source] = Some(1.0);

    let mut truth = BTreeSet::new();
    for (position, unit) in graph.units().iter().enumerate() {
        if unit.kind != UnitKind::DistributionUnit {
            continue;
        }

        let mut stack = vec![position];
        while let Some(&current) = stack.last() {
            if fractions[current].is_some() {
                stack.pop();
                continue;
            }
            if graph.unit(current).produced_at < event.contaminated_at {
                fractions[current] = Some(0.0);
                stack.pop();
                continue;
            }

            let pending = graph
                .parent_positions(current)
                .iter()
                .copied()
                .filter(|&parent| fractions[parent].is_none())
                .collect::<Vec<_>>();
            if pending.is_empty() {
                let fraction = graph.inherited_fraction(current, dilution_threshold, |parent| {
                    fractions[parent].unwrap_or(0.0)
                });
                fractions[current] = Some(fraction);
                stack.pop();
            } else {
                stack.extend(pending);
            }
        }

        if fractions[position].is_some_and(|fraction| fraction > 0.0) {
            truth.insert(unit.id.clone());
        }
    }

    Ok(truth)
}

/// Share of recalled units that are truly contaminated.
///
/// An empty recall is perfectly precise only when nothing was contaminated.
#[must_use]
pub fn precision(truth: &BTreeSet<UnitId>, recalled: &BTreeSet<UnitId>) -> f64 {
    if recalled.is_empty() {
        return if truth.is_empty() { 1.0 } else { 0.0 };
    }
    usize_to_f64(recalled.intersection(truth).count()) / usize_to_f64(recalled.len())
}

/// Share of contaminated units that were recalled; 1.0 when nothing was contaminated.
#[must_use]
pub fn recall(truth: &BTreeSet<UnitId>, recalled: &BTreeSet<UnitId>) -> f64 {
    if truth.is_empty() {
        return 1.0;
    }
    usize_to_f64(recalled.intersection(truth).count()) / usize_to_f64(truth.len())
}

/// `1 - trace_forward / baseline`; `None` when the baseline recalled nothing.
///
/// Negative when trace-forward recalls more units than the baseline.
#[must_use]
pub fn scope_reduction(trace_forward_size: usize, baseline_size: usize) -> Option<f64> {
    if baseline_size == 0 {
        return None;
    }
    Some(1.0 - usize_to_f64(trace_forward_size) / usize_to_f64(baseline_size))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScopeMetrics {
    pub scope_size: usize,
    pub true_positives: usize,
    pub ground_truth_size: usize,
    pub precision: f64,
    pub recall: f64,
}

#[must_use]
pub fn score_scope(truth: &BTreeSet<UnitId>, recalled: &BTreeSet<UnitId>) -> ScopeMetrics {
    ScopeMetrics {
        scope_size: recalled.len(),
        true_positives: recalled.intersection(truth).count(),
        ground_truth_size: truth.len(),
        precision: precision(truth, recalled),
        recall: recall(truth, recalled),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Nearest-rank percentile over already sorted values.
#[must_use]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (p.clamp(0.0, 100.0) / 100.0 * usize_to_f64(last)).round();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = (rank as usize).min(last);
    sorted.get(index).copied()
}

/// Mean, population standard deviation, and nearest-rank p50/p95 of `values`.
///
/// Non-finite values are ignored; `None` when nothing remains.
#[must_use]
pub fn summarize(values: &[f64]) -> Option<MetricSummary> {
    let mut sorted = values.iter().copied().filter(|value| value.is_finite()).collect::<Vec<_>>();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let count = usize_to_f64(sorted.len());
    let mean = sorted.iter().sum::<f64>() / count;
    let variance = sorted.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / count;

    Some(MetricSummary {
        count: sorted.len(),
        mean,
        std_dev: variance.sqrt(),
        p50: percentile(&sorted, 50.0)?,
        p95: percentile(&sorted, 95.0)?,
    })
}
