use std::collections::BTreeSet;

use time::Duration;

use crate::graph::LineageGraph;
use crate::model::{ContaminationEvent, RecallScope, RiskLevel, Strategy, UnitKind};
use crate::RecallError;

/// A recall strategy turning one contamination event into a recall scope.
///
/// Implementations are pure functions of `(graph, event)` and never mutate the graph.
pub trait RecallResolver {
    fn strategy(&self) -> Strategy;

    /// # Errors
    /// Returns [`RecallError::Resolution`] when the event does not reference a farm or milk
    /// lot present in `graph`.
    fn resolve(
        &self,
        graph: &LineageGraph,
        event: &ContaminationEvent,
    ) -> Result<RecallScope, RecallError>;
}

pub(crate) fn source_position(
    graph: &LineageGraph,
    event: &ContaminationEvent,
) -> Result<usize, RecallError> {
    let Some(position) = graph.position(&event.source) else {
        return Err(RecallError::Resolution(format!(
            "event {} references unknown source unit {}",
            event.event_id, event.source
        )));
    };

    let kind = graph.unit(position).kind;
    if !kind.is_source() {
        return Err(RecallError::Resolution(format!(
            "event {} source {} is a {}, expected farm or milk_lot",
            event.event_id,
            event.source,
            kind.as_str()
        )));
    }

    Ok(position)
}

pub(crate) fn validate_dilution_threshold(threshold: f64) -> Result<(), RecallError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(RecallError::Resolution(format!(
            "dilution_threshold MUST be within [0.0, 1.0], got {threshold}"
        )))
    }
}

/// Line and shift-log recall: every distribution unit on the source's line produced within
/// `±window_hours` of the confirmation time. Derivation edges are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineResolver {
    pub window_hours: u32,
}

impl BaselineResolver {
    #[must_use]
    pub fn new(window_hours: u32) -> Self {
        Self { window_hours }
    }
}

impl RecallResolver for BaselineResolver {
    fn strategy(&self) -> Strategy {
        Strategy::Baseline
    }

    fn resolve(
        &self,
        graph: &LineageGraph,
        event: &ContaminationEvent,
    ) -> Result<RecallScope, RecallError> {
        let source = graph.unit(source_position(graph, event)?);
        let line = source.line_id.as_deref();
        let window = Duration::hours(i64::from(self.window_hours));
        let (Some(earliest), Some(latest)) =
            (event.confirmed_at.checked_sub(window), event.confirmed_at.checked_add(window))
        else {
            return Err(RecallError::Resolution(format!(
                "window_hours={} around event {} leaves the supported calendar range",
                self.window_hours, event.event_id
            )));
        };

        let mut scope = RecallScope::empty(&event.event_id, Strategy::Baseline);
        scope.units = graph
            .units_of_kind(UnitKind::DistributionUnit)
            .filter(|unit| line.is_none() || unit.line_id.as_deref() == line)
            .filter(|unit| unit.produced_at >= earliest && unit.produced_at <= latest)
            .map(|unit| unit.id.clone())
            .collect();

        Ok(scope)
    }
}

/// Lineage recall: distribution units forward-reachable from the contaminated source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceForwardResolver {
    dilution_threshold: f64,
}

impl TraceForwardResolver {
    /// # Errors
    /// Returns [`RecallError::Resolution`] when the threshold is outside `[0, 1]`.
    pub fn new(dilution_threshold: f64) -> Result<Self, RecallError> {
        validate_dilution_threshold(dilution_threshold)?;
        Ok(Self { dilution_threshold })
    }

    #[must_use]
    pub fn dilution_threshold(&self) -> f64 {
        self.dilution_threshold
    }

    fn contaminated_positions(
        &self,
        graph: &LineageGraph,
        event: &ContaminationEvent,
        source: usize,
    ) -> Vec<usize> {
        let reachable = graph.forward_reachable(source, event.contaminated_at);
        if self.dilution_threshold <= 0.0 {
            return reachable;
        }

        // Parents are strictly older than children, so time order is a topological order.
        let mut ordered = reachable;
        ordered.sort_by_key(|&position| (graph.unit(position).produced_at, position));
        let mut fractions = vec![0.0_f64; graph.len()];
        fractions[source] = 1.0;

        let mut contaminated = vec![source];
        for position in ordered.into_iter().filter(|&position| position != source) {
            let fraction = graph
                .inherited_fraction(position, self.dilution_threshold, |parent| fractions[parent]);
            if fraction > 0.0 {
                fractions[position] = fraction;
                contaminated.push(position);
            }
        }
        contaminated
    }
}

impl Default for TraceForwardResolver {
    fn default() -> Self {
        Self { dilution_threshold: 0.0 }
    }
}

impl RecallResolver for TraceForwardResolver {
    fn strategy(&self) -> Strategy {
        Strategy::TraceForward
    }

    fn resolve(
        &self,
        graph: &LineageGraph,
        event: &ContaminationEvent,
    ) -> Result<RecallScope, RecallError> {
        let source = source_position(graph, event)?;
        let contaminated = self.contaminated_positions(graph, event, source);

        let mut scope = RecallScope::empty(&event.event_id, Strategy::TraceForward);
        let mut batches = BTreeSet::new();
        for position in contaminated {
            let unit = graph.unit(position);
            match unit.kind {
                UnitKind::DistributionUnit => {
                    scope.units.insert(unit.id.clone());
                }
                UnitKind::CheeseBatch => {
                    batches.insert(unit.id.clone());
                }
                UnitKind::Farm | UnitKind::MilkLot => {}
            }
        }
        if event.risk == RiskLevel::High {
            scope.quarantined_batches = batches;
        }

        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashSet};

    use proptest::prelude::*;
    use time::macros::datetime;
    use time::OffsetDateTime;

    use super::*;
    use crate::graph::{generate_lineage_graph, GraphParams};
    use crate::inject::{generate_contamination, ContaminationOnset, InjectionParams};
    use crate::model::{ProductionUnit, Strategy, UnitId};

    fn at(hour: i64) -> OffsetDateTime {
        datetime!(2025-01-01 00:00 UTC) + Duration::hours(hour)
    }

    fn unit(
        id: &str,
        kind: UnitKind,
        hour: i64,
        line: Option<&str>,
        parents: &[&str],
        volume_liters: f64,
    ) -> ProductionUnit {
        ProductionUnit {
            id: UnitId::from(id),
            kind,
            produced_at: at(hour),
            line_id: line.map(str::to_string),
            parents: parents.iter().map(|parent| UnitId::from(*parent)).collect(),
            volume_liters,
        }
    }

    /// Two farms, four lots, two batches of k=2, two distribution units per batch.
    /// Batch A uses ML-1 and ML-3, batch B uses ML-2 and ML-4; all four distribution units
    /// are packed on LINE-1 at the same hour.
    fn scenario_graph() -> LineageGraph {
        let units = vec![
            unit("FARM-1", UnitKind::Farm, 0, None, &[], 0.0),
            unit("FARM-2", UnitKind::Farm, 0, None, &[], 0.0),
            unit("ML-1", UnitKind::MilkLot, 1, Some("LINE-1"), &["FARM-1"], 500.0),
            unit("ML-2", UnitKind::MilkLot, 2, Some("LINE-1"), &["FARM-1"], 500.0),
            unit("ML-3", UnitKind::MilkLot, 1, Some("LINE-1"), &["FARM-2"], 500.0),
            unit("ML-4", UnitKind::MilkLot, 2, Some("LINE-1"), &["FARM-2"], 500.0),
            unit("CB-A", UnitKind::CheeseBatch, 8, Some("LINE-1"), &["ML-1", "ML-3"], 1000.0),
            unit("CB-B", UnitKind::CheeseBatch, 8, Some("LINE-1"), &["ML-2", "ML-4"], 1000.0),
            unit("DU-A1", UnitKind::DistributionUnit, 56, Some("LINE-1"), &["CB-A"], 500.0),
            unit("DU-A2", UnitKind::DistributionUnit, 56, Some("LINE-1"), &["CB-A"], 500.0),
            unit("DU-B1", UnitKind::DistributionUnit, 56, Some("LINE-1"), &["CB-B"], 500.0),
            unit("DU-B2", UnitKind::DistributionUnit, 56, Some("LINE-1"), &["CB-B"], 500.0),
        ];
        match LineageGraph::from_units(units) {
            Ok(graph) => graph,
            Err(err) => panic!("scenario graph should assemble: {err}"),
        }
    }

    fn event(
        source: &str,
        contaminated_hour: i64,
        confirmed_hour: i64,
        risk: RiskLevel,
    ) -> ContaminationEvent {
        ContaminationEvent {
            event_id: "EV-0001".to_string(),
            source: UnitId::from(source),
            contaminated_at: at(contaminated_hour),
            confirmed_at: at(confirmed_hour),
            detection_delay_days: 0,
            risk,
        }
    }

    fn resolve(
        resolver: &dyn RecallResolver,
        graph: &LineageGraph,
        event: &ContaminationEvent,
    ) -> RecallScope {
        match resolver.resolve(graph, event) {
            Ok(scope) => scope,
            Err(err) => panic!("{} resolution should succeed: {err}", resolver.strategy()),
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<UnitId> {
        values.iter().map(|value| UnitId::from(*value)).collect()
    }

    fn independent_reachable_units(
        graph: &LineageGraph,
        event: &ContaminationEvent,
    ) -> BTreeSet<UnitId> {
        let mut found = BTreeSet::new();
        let mut seen = HashSet::new();
        let mut stack = vec![event.source.clone()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for child in graph.children(&id) {
                if child.produced_at < event.contaminated_at {
                    continue;
                }
                if child.kind == UnitKind::DistributionUnit {
                    found.insert(child.id.clone());
                }
                stack.push(child.id.clone());
            }
        }
        found
    }

    #[test]
    fn trace_forward_recalls_only_units_of_the_contaminated_batch() {
        let graph = scenario_graph();
        let contaminated = event("ML-1", 1, 56, RiskLevel::Low);
        let scope = resolve(&TraceForwardResolver::default(), &graph, &contaminated);

        assert_eq!(scope.units, ids(&["DU-A1", "DU-A2"]));
        assert_eq!(scope.strategy, Strategy::TraceForward);
        assert!(scope.quarantined_batches.is_empty());
    }

    #[test]
    fn baseline_with_zero_window_recalls_coinciding_units_on_the_line() {
        let graph = scenario_graph();
        let contaminated = event("ML-1", 1, 56, RiskLevel::Low);
        let scope = resolve(&BaselineResolver::new(0), &graph, &contaminated);

        assert_eq!(scope.units, ids(&["DU-A1", "DU-A2", "DU-B1", "DU-B2"]));
    }

    #[test]
    fn baseline_ignores_other_lines() {
        let mut units = scenario_graph().units().to_vec();
        for unit in &mut units {
            if unit.id.as_str().starts_with("DU-B") {
                unit.line_id = Some("LINE-2".to_string());
            }
        }
        let graph = match LineageGraph::from_units(units) {
            Ok(graph) => graph,
            Err(err) => panic!("graph should assemble: {err}"),
        };

        let contaminated = event("ML-1", 1, 56, RiskLevel::Low);
        let scope = resolve(&BaselineResolver::new(0), &graph, &contaminated);
        assert_eq!(scope.units, ids(&["DU-A1", "DU-A2"]));
    }

    #[test]
    fn farm_sources_without_line_are_not_line_filtered() {
        let graph = scenario_graph();
        let contaminated = event("FARM-2", 0, 57, RiskLevel::Low);
        let scope = resolve(&BaselineResolver::new(1), &graph, &contaminated);

        assert_eq!(scope.len(), 4);
    }

    #[test]
    fn contamination_after_downstream_processing_yields_empty_scopes() {
        let graph = scenario_graph();
        let late = event("ML-1", 20, 200, RiskLevel::Medium);

        assert!(resolve(&TraceForwardResolver::default(), &graph, &late).is_empty());
        assert!(resolve(&BaselineResolver::new(24), &graph, &late).is_empty());
    }

    #[test]
    fn high_risk_events_quarantine_lineage_batches() {
        let graph = scenario_graph();
        let contaminated = event("FARM-1", 0, 60, RiskLevel::High);
        let scope = resolve(&TraceForwardResolver::default(), &graph, &contaminated);

        assert_eq!(scope.quarantined_batches, ids(&["CB-A", "CB-B"]));
        assert_eq!(scope.len(), 4);
    }

    #[test]
    fn dilution_threshold_excludes_minor_contributions() {
        let mut units = scenario_graph().units().to_vec();
        for unit in &mut units {
            if unit.id.as_str() == "ML-1" {
                unit.volume_liters = 100.0;
            }
        }
        let graph = match LineageGraph::from_units(units) {
            Ok(graph) => graph,
            Err(err) => panic!("graph should assemble: {err}"),
        };
        let contaminated = event("ML-1", 1, 56, RiskLevel::Low);

        let strict = match TraceForwardResolver::new(0.25) {
            Ok(resolver) => resolver,
            Err(err) => panic!("threshold should be valid: {err}"),
        };
        let lenient = match TraceForwardResolver::new(0.1) {
            Ok(resolver) => resolver,
            Err(err) => panic!("threshold should be valid: {err}"),
        };

        assert!(resolve(&strict, &graph, &contaminated).is_empty());
        assert_eq!(resolve(&lenient, &graph, &contaminated).units, ids(&["DU-A1", "DU-A2"]));
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        assert!(matches!(TraceForwardResolver::new(1.5), Err(RecallError::Resolution(_))));
        assert!(matches!(TraceForwardResolver::new(f64::NAN), Err(RecallError::Resolution(_))));
    }

    #[test]
    fn unknown_or_non_source_units_fail_resolution() {
        let graph = scenario_graph();

        for source in ["ML-404", "CB-A"] {
            let contaminated = event(source, 1, 56, RiskLevel::Low);
            let result = TraceForwardResolver::default().resolve(&graph, &contaminated);
            assert!(matches!(result, Err(RecallError::Resolution(_))), "source {source}");
            let result = BaselineResolver::new(24).resolve(&graph, &contaminated);
            assert!(matches!(result, Err(RecallError::Resolution(_))), "source {source}");
        }
    }

    #[test]
    fn window_beyond_the_calendar_fails_resolution() {
        let graph = scenario_graph();
        let contaminated = event("ML-1", 1, 56, RiskLevel::Low);

        let Err(err) = BaselineResolver::new(u32::MAX).resolve(&graph, &contaminated) else {
            panic!("an unrepresentable window should be rejected");
        };
        assert!(matches!(err, RecallError::Resolution(_)));
        assert!(err.to_string().contains("window_hours=4294967295"));
    }

    fn generated_fixture(seed: u64) -> (LineageGraph, Vec<ContaminationEvent>) {
        let params = GraphParams {
            farms: 4,
            milk_lots_per_farm: 12,
            cheese_batches: 24,
            mixing_k: 3,
            distribution_units_per_batch: 3,
            horizon_days: 6,
            ..GraphParams::default()
        };
        let graph = match generate_lineage_graph(&params, seed) {
            Ok(graph) => graph,
            Err(err) => panic!("graph should build: {err}"),
        };
        let injection = InjectionParams {
            prevalence: 0.2,
            onset: ContaminationOnset::AtProduction,
            ..InjectionParams::default()
        };
        let events = match generate_contamination(&graph, &injection, seed) {
            Ok(events) => events,
            Err(err) => panic!("injection should succeed: {err}"),
        };
        (graph, events)
    }

    proptest! {
        #[test]
        fn property_trace_forward_matches_independent_reachability(seed in any::<u64>()) {
            let (graph, events) = generated_fixture(seed);
            for event in &events {
                let scope = TraceForwardResolver::default().resolve(&graph, event);
                prop_assert!(scope.is_ok());
                prop_assert_eq!(
                    scope.unwrap_or_else(|_| unreachable!()).units,
                    independent_reachable_units(&graph, event)
                );
            }
        }

        #[test]
        fn property_baseline_scope_grows_with_window(
            seed in any::<u64>(),
            narrow in 0_u32..48,
            extra in 0_u32..96
        ) {
            let (graph, events) = generated_fixture(seed);
            for event in &events {
                let small = BaselineResolver::new(narrow).resolve(&graph, event);
                let large = BaselineResolver::new(narrow + extra).resolve(&graph, event);
                prop_assert!(small.is_ok());
                prop_assert!(large.is_ok());
                let small = small.unwrap_or_else(|_| unreachable!());
                let large = large.unwrap_or_else(|_| unreachable!());
                prop_assert!(small.len() <= large.len());
                prop_assert!(small.units.is_subset(&large.units));
            }
        }

        #[test]
        fn property_resolution_is_deterministic(seed in any::<u64>()) {
            let (graph_a, events_a) = generated_fixture(seed);
            let (graph_b, events_b) = generated_fixture(seed);
            prop_assert_eq!(&events_a, &events_b);
            for (event_a, event_b) in events_a.iter().zip(&events_b) {
                prop_assert_eq!(
                    TraceForwardResolver::default().resolve(&graph_a, event_a),
                    TraceForwardResolver::default().resolve(&graph_b, event_b)
                );
                prop_assert_eq!(
                    BaselineResolver::new(24).resolve(&graph_a, event_a),
                    BaselineResolver::new(24).resolve(&graph_b, event_b)
                );
            }
        }
    }
}
