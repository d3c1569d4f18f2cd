use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::graph::{usize_to_f64, LineageGraph};
use crate::metrics::{ground_truth, scope_reduction, score_scope, summarize, MetricSummary};
use crate::model::{union_scopes, ContaminationEvent, RecallScope, RiskLevel, Strategy, UnitId};
use crate::resolve::{BaselineResolver, RecallResolver, TraceForwardResolver};
use crate::RecallError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecallParams {
    pub window_hours: u32,
    pub dilution_threshold: f64,
}

impl Default for RecallParams {
    fn default() -> Self {
        Self { window_hours: 24, dilution_threshold: 0.0 }
    }
}

impl RecallParams {
    /// # Errors
    /// Returns [`RecallError::Resolution`] when the dilution threshold is outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), RecallError> {
        TraceForwardResolver::new(self.dilution_threshold).map(|_| ())
    }
}

/// One (event, strategy) outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecallResultRow {
    pub event_id: String,
    pub strategy: Strategy,
    pub source: UnitId,
    pub risk: RiskLevel,
    pub line_id: Option<String>,
    pub window_hours: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub confirmed_at: OffsetDateTime,
    pub recalled: Vec<UnitId>,
    pub scope_size: usize,
    pub true_affected: usize,
    pub ground_truth_size: usize,
    pub precision: f64,
    pub recall: f64,
    pub scope_reduction: Option<f64>,
    pub quarantined_batches: usize,
    /// Milk lots and farms behind the quarantined batches.
    #[serde(default)]
    pub quarantine_origins: Vec<UnitId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategySummary {
    pub strategy: Strategy,
    pub events: usize,
    pub total_recalled: usize,
    pub distinct_recalled: usize,
    pub quarantined_batches: usize,
    pub scope_size: Option<MetricSummary>,
    pub precision: Option<MetricSummary>,
    pub recall: Option<MetricSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSummary {
    pub events: usize,
    pub window_hours: u32,
    pub dilution_threshold: f64,
    pub strategies: Vec<StrategySummary>,
    pub scope_reduction: Option<MetricSummary>,
    pub scope_reduction_unavailable: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentReport {
    pub rows: Vec<RecallResultRow>,
    pub summary: ExperimentSummary,
}

/// Resolve every event with both strategies and score them against ground truth.
///
/// Rows are emitted per event in input order, baseline first.
///
/// # Errors
/// Returns [`RecallError::Resolution`] when the parameters are invalid or an event cannot be
/// resolved against `graph`.
pub fn run_experiment(
    graph: &LineageGraph,
    events: &[ContaminationEvent],
    params: &RecallParams,
) -> Result<ExperimentReport, RecallError> {
    params.validate()?;
    let baseline = BaselineResolver::new(params.window_hours);
    let trace_forward = TraceForwardResolver::new(params.dilution_threshold)?;

    let mut rows = Vec::with_capacity(events.len() * 2);
    let mut baseline_scopes = Vec::with_capacity(events.len());
    let mut trace_scopes = Vec::with_capacity(events.len());
    let mut reductions = Vec::new();
    let mut reductions_unavailable = 0_usize;

    for event in events {
        let truth = ground_truth(graph, event, params.dilution_threshold)?;
        let baseline_scope = baseline.resolve(graph, event)?;
        let trace_scope = trace_forward.resolve(graph, event)?;
        let reduction = scope_reduction(trace_scope.len(), baseline_scope.len());
        match reduction {
            Some(value) => reductions.push(value),
            None => reductions_unavailable += 1,
        }

        let line_id = graph.get(&event.source).and_then(|unit| unit.line_id.clone());
        for scope in [&baseline_scope, &trace_scope] {
            let metrics = score_scope(&truth, &scope.units);
            rows.push(RecallResultRow {
                event_id: event.event_id.clone(),
                strategy: scope.strategy,
                source: event.source.clone(),
                risk: event.risk,
                line_id: line_id.clone(),
                window_hours: params.window_hours,
                confirmed_at: event.confirmed_at,
                recalled: scope.units.iter().cloned().collect(),
                scope_size: metrics.scope_size,
                true_affected: metrics.true_positives,
                ground_truth_size: metrics.ground_truth_size,
                precision: metrics.precision,
                recall: metrics.recall,
                scope_reduction: reduction,
                quarantined_batches: scope.quarantined_batches.len(),
                quarantine_origins: quarantine_origins(graph, scope)?,
            });
        }

        tracing::debug!(
            event_id = %event.event_id,
            source = %event.source,
            ground_truth = truth.len(),
            baseline = baseline_scope.len(),
            trace_forward = trace_scope.len(),
            "resolved contamination event"
        );
        baseline_scopes.push(baseline_scope);
        trace_scopes.push(trace_scope);
    }

    let strategies = vec![
        summarize_strategy(Strategy::Baseline, &rows, &baseline_scopes),
        summarize_strategy(Strategy::TraceForward, &rows, &trace_scopes),
    ];
    let summary = ExperimentSummary {
        events: events.len(),
        window_hours: params.window_hours,
        dilution_threshold: params.dilution_threshold,
        strategies,
        scope_reduction: summarize(&reductions),
        scope_reduction_unavailable: reductions_unavailable,
    };

    tracing::info!(
        events = summary.events,
        rows = rows.len(),
        mean_scope_reduction = summary.scope_reduction.map(|reduction| reduction.mean),
        scope_reduction_unavailable = summary.scope_reduction_unavailable,
        "recall experiment complete"
    );
    Ok(ExperimentReport { rows, summary })
}

fn quarantine_origins(
    graph: &LineageGraph,
    scope: &RecallScope,
) -> Result<Vec<UnitId>, RecallError> {
    let mut origins = BTreeSet::new();
    for batch in &scope.quarantined_batches {
        origins.extend(graph.trace_back(batch)?.into_iter().map(|unit| unit.id.clone()));
    }
    Ok(origins.into_iter().collect())
}

fn summarize_strategy(
    strategy: Strategy,
    rows: &[RecallResultRow],
    scopes: &[RecallScope],
) -> StrategySummary {
    let rows = rows.iter().filter(|row| row.strategy == strategy).collect::<Vec<_>>();
    let metric = |value: fn(&RecallResultRow) -> f64| {
        summarize(&rows.iter().map(|row| value(row)).collect::<Vec<_>>())
    };

    StrategySummary {
        strategy,
        events: rows.len(),
        total_recalled: rows.iter().map(|row| row.scope_size).sum(),
        distinct_recalled: union_scopes(scopes).len(),
        quarantined_batches: rows.iter().map(|row| row.quarantined_batches).sum(),
        scope_size: metric(|row| usize_to_f64(row.scope_size)),
        precision: metric(|row| row.precision),
        recall: metric(|row| row.recall),
    }
}
