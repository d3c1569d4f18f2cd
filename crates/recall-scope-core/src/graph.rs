use std::collections::{HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

use crate::model::{ProductionUnit, UnitId, UnitKind};
use crate::RecallError;

pub const MIN_LOT_VOLUME_LITERS: f64 = 150.0;
pub const MAX_LOT_VOLUME_LITERS: f64 = 900.0;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphParams {
    pub farms: u32,
    pub milk_lots_per_farm: u32,
    pub cheese_batches: u32,
    pub mixing_k: u32,
    pub distribution_units_per_batch: u32,
    pub horizon_days: u32,
    pub line_count: u32,
    pub processing_latency_hours: u32,
    pub packaging_latency_hours: u32,
    pub milk_freshness_hours: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
}

impl Default for GraphParams {
    fn default() -> Self {
        Self {
            farms: 15,
            milk_lots_per_farm: 36,
            cheese_batches: 210,
            mixing_k: 4,
            distribution_units_per_batch: 4,
            horizon_days: 14,
            line_count: 2,
            processing_latency_hours: 6,
            packaging_latency_hours: 48,
            milk_freshness_hours: 72,
            start: datetime!(2025-01-01 06:00 UTC),
        }
    }
}

impl GraphParams {
    /// End of the production horizon.
    ///
    /// # Errors
    /// Returns [`RecallError::GraphConstruction`] when the horizon, the freshness window
    /// before it, or the latencies applied after it leave the supported calendar range.
    pub fn horizon_end(&self) -> Result<OffsetDateTime, RecallError> {
        let out_of_range = |name: &str, value: u32| {
            RecallError::GraphConstruction(format!(
                "{name}={value} moves the timeline outside the supported calendar range"
            ))
        };
        let hours = |value: u32| Duration::hours(i64::from(value));

        let horizon_end = self
            .start
            .checked_add(Duration::days(i64::from(self.horizon_days)))
            .ok_or_else(|| out_of_range("horizon_days", self.horizon_days))?;
        let latest_batch = horizon_end
            .checked_add(hours(self.processing_latency_hours))
            .ok_or_else(|| {
                out_of_range("processing_latency_hours", self.processing_latency_hours)
            })?;
        latest_batch
            .checked_add(hours(self.packaging_latency_hours))
            .ok_or_else(|| {
                out_of_range("packaging_latency_hours", self.packaging_latency_hours)
            })?;
        self.start
            .checked_sub(hours(self.milk_freshness_hours))
            .ok_or_else(|| out_of_range("milk_freshness_hours", self.milk_freshness_hours))?;

        Ok(horizon_end)
    }

    #[must_use]
    pub fn total_milk_lots(&self) -> u64 {
        u64::from(self.farms) * u64::from(self.milk_lots_per_farm)
    }

    /// Check structural parameters before any sampling happens.
    ///
    /// # Errors
    /// Returns [`RecallError::GraphConstruction`] when a count or latency is not positive,
    /// when the mixing factor exceeds the number of milk lots the graph will contain, or when
    /// the timeline does not fit the calendar.
    pub fn validate(&self) -> Result<(), RecallError> {
        for (name, value) in [
            ("farms", self.farms),
            ("milk_lots_per_farm", self.milk_lots_per_farm),
            ("cheese_batches", self.cheese_batches),
            ("mixing_k", self.mixing_k),
            ("distribution_units_per_batch", self.distribution_units_per_batch),
            ("horizon_days", self.horizon_days),
            ("line_count", self.line_count),
            ("processing_latency_hours", self.processing_latency_hours),
            ("packaging_latency_hours", self.packaging_latency_hours),
        ] {
            if value == 0 {
                return Err(RecallError::GraphConstruction(format!("{name} MUST be positive")));
            }
        }

        if u64::from(self.mixing_k) > self.total_milk_lots() {
            return Err(RecallError::GraphConstruction(format!(
                "mixing factor k={} exceeds the {} milk lots available",
                self.mixing_k,
                self.total_milk_lots()
            )));
        }

        self.horizon_end().map(|_| ())
    }
}

/// Immutable arena of production units with parent and child adjacency built once.
#[derive(Debug, Clone)]
pub struct LineageGraph {
    units: Vec<ProductionUnit>,
    index: HashMap<UnitId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    horizon_end: OffsetDateTime,
}

impl LineageGraph {
    /// Assemble a graph from externally supplied units.
    ///
    /// The production horizon ends at the latest unit timestamp.
    ///
    /// # Errors
    /// Returns [`RecallError::GraphConstruction`] for empty input, duplicate identifiers,
    /// parent-list violations, or parents not strictly older than their children, and
    /// [`RecallError::Resolution`] when a parent identifier does not exist.
    pub fn from_units(units: Vec<ProductionUnit>) -> Result<Self, RecallError> {
        let Some(horizon_end) = units.iter().map(|unit| unit.produced_at).max() else {
            return Err(RecallError::GraphConstruction(
                "lineage graph MUST contain at least one unit".to_string(),
            ));
        };
        Self::assemble(units, horizon_end)
    }

    fn assemble(
        units: Vec<ProductionUnit>,
        horizon_end: OffsetDateTime,
    ) -> Result<Self, RecallError> {
        let mut index = HashMap::with_capacity(units.len());
        for (position, unit) in units.iter().enumerate() {
            if index.insert(unit.id.clone(), position).is_some() {
                return Err(RecallError::GraphConstruction(format!(
                    "duplicate unit identifier {}",
                    unit.id
                )));
            }
        }

        let mut parents = vec![Vec::new(); units.len()];
        let mut children = vec![Vec::new(); units.len()];
        for (position, unit) in units.iter().enumerate() {
            validate_unit_shape(unit)?;

            let mut seen = HashSet::with_capacity(unit.parents.len());
            for parent_id in &unit.parents {
                if !seen.insert(parent_id) {
                    return Err(RecallError::GraphConstruction(format!(
                        "unit {} lists parent {parent_id} more than once",
                        unit.id
                    )));
                }
                let Some(&parent) = index.get(parent_id) else {
                    return Err(RecallError::Resolution(format!(
                        "unit {} references unknown parent {parent_id}",
                        unit.id
                    )));
                };
                if units[parent].produced_at >= unit.produced_at {
                    return Err(RecallError::GraphConstruction(format!(
                        "parent {parent_id} MUST be produced before child {}",
                        unit.id
                    )));
                }
                parents[position].push(parent);
                children[parent].push(position);
            }
        }

        Ok(Self { units, index, parents, children, horizon_end })
    }

    #[must_use]
    pub fn units(&self) -> &[ProductionUnit] {
        &self.units
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn horizon_end(&self) -> OffsetDateTime {
        self.horizon_end
    }

    #[must_use]
    pub fn get(&self, id: &UnitId) -> Option<&ProductionUnit> {
        self.index.get(id).map(|&position| &self.units[position])
    }

    pub fn units_of_kind(&self, kind: UnitKind) -> impl Iterator<Item = &ProductionUnit> + '_ {
        self.units.iter().filter(move |unit| unit.kind == kind)
    }

    /// Units directly derived from `id`, in insertion order.
    #[must_use]
    pub fn children(&self, id: &UnitId) -> Vec<&ProductionUnit> {
        self.index
            .get(id)
            .map(|&position| {
                self.children[position].iter().map(|&child| &self.units[child]).collect()
            })
            .unwrap_or_default()
    }

    /// Farms and milk lots upstream of `id`, ordered by identifier.
    ///
    /// # Errors
    /// Returns [`RecallError::Resolution`] when `id` is not in the graph.
    pub fn trace_back(&self, id: &UnitId) -> Result<Vec<&ProductionUnit>, RecallError> {
        let Some(start) = self.position(id) else {
            return Err(RecallError::Resolution(format!("cannot trace unknown unit {id}")));
        };

        let mut visited = vec![false; self.units.len()];
        let mut stack = vec![start];
        let mut sources = Vec::new();
        visited[start] = true;
        while let Some(position) = stack.pop() {
            for &parent in &self.parents[position] {
                if visited[parent] {
                    continue;
                }
                visited[parent] = true;
                if self.units[parent].kind.is_source() {
                    sources.push(&self.units[parent]);
                }
                stack.push(parent);
            }
        }

        sources.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        Ok(sources)
    }

    pub(crate) fn position(&self, id: &UnitId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn unit(&self, position: usize) -> &ProductionUnit {
        &self.units[position]
    }

    pub(crate) fn parent_positions(&self, position: usize) -> &[usize] {
        &self.parents[position]
    }

    /// Breadth-first forward closure of `source`, entering only children produced at or
    /// after `not_before`. The source itself is always the first element.
    pub(crate) fn forward_reachable(
        &self,
        source: usize,
        not_before: OffsetDateTime,
    ) -> Vec<usize> {
        let mut visited = vec![false; self.units.len()];
        let mut order = Vec::new();
        let mut queue = VecDeque::from([source]);
        visited[source] = true;

        while let Some(position) = queue.pop_front() {
            order.push(position);
            for &child in &self.children[position] {
                if visited[child] || self.units[child].produced_at < not_before {
                    continue;
                }
                visited[child] = true;
                queue.push_back(child);
            }
        }

        order
    }

    /// Contaminated fraction a unit inherits from its parents.
    ///
    /// Any contaminated parent marks the unit as contaminated; the volume-weighted share
    /// is then compared against `dilution_threshold` when it is positive.
    pub(crate) fn inherited_fraction<F>(
        &self,
        position: usize,
        dilution_threshold: f64,
        fraction_of: F,
    ) -> f64
    where
        F: Fn(usize) -> f64,
    {
        let parents = &self.parents[position];
        if !parents.iter().any(|&parent| fraction_of(parent) > 0.0) {
            return 0.0;
        }

        let total_volume: f64 =
            parents.iter().map(|&parent| self.units[parent].volume_liters.max(0.0)).sum();
        let share = if total_volume > 0.0 {
            parents
                .iter()
                .map(|&parent| self.units[parent].volume_liters.max(0.0) * fraction_of(parent))
                .sum::<f64>()
                / total_volume
        } else {
            parents.iter().map(|&parent| fraction_of(parent)).sum::<f64>()
                / usize_to_f64(parents.len())
        };

        if dilution_threshold > 0.0 && share < dilution_threshold {
            return 0.0;
        }
        share.max(f64::MIN_POSITIVE)
    }
}

fn validate_unit_shape(unit: &ProductionUnit) -> Result<(), RecallError> {
    if unit.id.as_str().trim().is_empty() {
        return Err(RecallError::GraphConstruction("unit identifier MUST be non-empty".to_string()));
    }

    match (unit.kind, unit.parents.is_empty()) {
        (UnitKind::Farm, false) => {
            return Err(RecallError::GraphConstruction(format!(
                "farm {} MUST NOT have parents",
                unit.id
            )));
        }
        (UnitKind::MilkLot | UnitKind::CheeseBatch | UnitKind::DistributionUnit, true) => {
            return Err(RecallError::GraphConstruction(format!(
                "{} {} MUST have at least one parent",
                unit.kind.as_str(),
                unit.id
            )));
        }
        _ => {}
    }

    if !unit.volume_liters.is_finite() || unit.volume_liters < 0.0 {
        return Err(RecallError::GraphConstruction(format!(
            "unit {} volume_liters MUST be a non-negative number",
            unit.id
        )));
    }

    Ok(())
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn usize_to_f64(value: usize) -> f64 {
    value as f64
}

fn line_name(line: u32) -> String {
    format!("LINE-{line}")
}

/// Build a lineage graph drawing every random choice from `rng`.
///
/// # Errors
/// Returns [`RecallError::GraphConstruction`] when [`GraphParams::validate`] fails or when
/// fewer than `mixing_k` milk lots precede a cheese batch.
pub fn build_lineage_graph<R>(
    params: &GraphParams,
    rng: &mut R,
) -> Result<LineageGraph, RecallError>
where
    R: Rng + ?Sized,
{
    params.validate()?;

    let horizon_end = params.horizon_end()?;
    let horizon_seconds = i64::from(params.horizon_days) * SECONDS_PER_DAY;
    let mut units = Vec::new();

    for farm in 1..=params.farms {
        units.push(ProductionUnit {
            id: UnitId(format!("FARM-{farm:03}")),
            kind: UnitKind::Farm,
            produced_at: params.start,
            line_id: None,
            parents: Vec::new(),
            volume_liters: 0.0,
        });
    }

    let mut lot_counter = 0_u64;
    for farm in 1..=params.farms {
        for _ in 0..params.milk_lots_per_farm {
            lot_counter += 1;
            let produced_at = params.start + Duration::seconds(rng.gen_range(1..=horizon_seconds));
            let line = rng.gen_range(1..=params.line_count);
            let volume = rng.gen_range(MIN_LOT_VOLUME_LITERS..=MAX_LOT_VOLUME_LITERS);
            units.push(ProductionUnit {
                id: UnitId(format!("ML-{lot_counter:06}")),
                kind: UnitKind::MilkLot,
                produced_at,
                line_id: Some(line_name(line)),
                parents: vec![UnitId(format!("FARM-{farm:03}"))],
                volume_liters: volume,
            });
        }
    }

    let mut lots_by_time = units
        .iter()
        .enumerate()
        .filter(|(_, unit)| unit.kind == UnitKind::MilkLot)
        .map(|(position, unit)| (unit.produced_at, position))
        .collect::<Vec<_>>();
    lots_by_time.sort_unstable();

    let k = usize::try_from(params.mixing_k).map_err(|_| {
        RecallError::GraphConstruction(format!("mixing factor k={} is too large", params.mixing_k))
    })?;
    let Some(&(earliest_full_mix, _)) = lots_by_time.get(k - 1) else {
        return Err(RecallError::GraphConstruction(format!(
            "mixing factor k={k} exceeds the {} milk lots available",
            lots_by_time.len()
        )));
    };

    let freshness = Duration::hours(i64::from(params.milk_freshness_hours));
    let processing = Duration::hours(i64::from(params.processing_latency_hours));
    let mut batch_positions = Vec::new();
    for batch in 1..=params.cheese_batches {
        let span = (horizon_end - earliest_full_mix).whole_seconds().max(0);
        let intended_at = earliest_full_mix + Duration::seconds(rng.gen_range(0..=span));

        let available =
            lots_by_time.partition_point(|(produced_at, _)| *produced_at <= intended_at);
        if available < k {
            return Err(RecallError::GraphConstruction(format!(
                "mixing factor k={k} exceeds the {available} milk lots available at {intended_at}"
            )));
        }
        let fresh_start = lots_by_time[..available]
            .partition_point(|(produced_at, _)| *produced_at < intended_at - freshness);
        let pool_start = if available - fresh_start >= k { fresh_start } else { available - k };
        let pool = &lots_by_time[pool_start..available];

        let mut parents = rand::seq::index::sample(rng, pool.len(), k)
            .iter()
            .map(|picked| pool[picked].1)
            .collect::<Vec<_>>();
        parents.sort_unstable();

        let Some(latest_parent) = parents.iter().map(|&parent| units[parent].produced_at).max()
        else {
            return Err(RecallError::GraphConstruction(format!(
                "cheese batch {batch} received no parent milk lots"
            )));
        };
        let volume = parents.iter().map(|&parent| units[parent].volume_liters).sum();
        let parent_ids = parents.iter().map(|&parent| units[parent].id.clone()).collect();
        let line = rng.gen_range(1..=params.line_count);

        batch_positions.push(units.len());
        units.push(ProductionUnit {
            id: UnitId(format!("CB-{batch:06}")),
            kind: UnitKind::CheeseBatch,
            produced_at: latest_parent + processing,
            line_id: Some(line_name(line)),
            parents: parent_ids,
            volume_liters: volume,
        });
    }

    let packaging = Duration::hours(i64::from(params.packaging_latency_hours));
    let share = f64::from(params.distribution_units_per_batch);
    let mut unit_counter = 0_u64;
    for position in batch_positions {
        let batch = units[position].clone();
        for _ in 0..params.distribution_units_per_batch {
            unit_counter += 1;
            units.push(ProductionUnit {
                id: UnitId(format!("DU-{unit_counter:08}")),
                kind: UnitKind::DistributionUnit,
                produced_at: batch.produced_at + packaging,
                line_id: batch.line_id.clone(),
                parents: vec![batch.id.clone()],
                volume_liters: batch.volume_liters / share,
            });
        }
    }

    let graph = LineageGraph::assemble(units, horizon_end)?;
    tracing::debug!(
        farms = params.farms,
        milk_lots = lot_counter,
        cheese_batches = params.cheese_batches,
        distribution_units = unit_counter,
        mixing_k = params.mixing_k,
        "built lineage graph"
    );
    Ok(graph)
}

/// Build a lineage graph from a fresh generator seeded with `seed`.
///
/// # Errors
/// See [`build_lineage_graph`].
pub fn generate_lineage_graph(
    params: &GraphParams,
    seed: u64,
) -> Result<LineageGraph, RecallError> {
    let mut rng = StdRng::seed_from_u64(seed);
    build_lineage_graph(params, &mut rng)
}
