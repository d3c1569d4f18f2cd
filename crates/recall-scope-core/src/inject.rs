use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::Duration;

use crate::graph::{usize_to_f64, LineageGraph};
use crate::model::{ContaminationEvent, ProductionUnit, RiskLevel, UnitKind};
use crate::RecallError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceLevel {
    #[default]
    MilkLot,
    Farm,
    Any,
}

impl SourceLevel {
    fn admits(self, kind: UnitKind) -> bool {
        match self {
            Self::MilkLot => kind == UnitKind::MilkLot,
            Self::Farm => kind == UnitKind::Farm,
            Self::Any => kind.is_source(),
        }
    }
}

/// When contamination starts relative to the source unit's production.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContaminationOnset {
    #[default]
    WithinHorizon,
    AtProduction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self { low: 0.6, medium: 0.3, high: 0.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InjectionParams {
    pub prevalence: f64,
    pub delay_min_days: u32,
    pub delay_max_days: u32,
    pub risk_weights: RiskWeights,
    pub source_level: SourceLevel,
    pub onset: ContaminationOnset,
}

impl Default for InjectionParams {
    fn default() -> Self {
        Self {
            prevalence: 0.03,
            delay_min_days: 7,
            delay_max_days: 14,
            risk_weights: RiskWeights::default(),
            source_level: SourceLevel::default(),
            onset: ContaminationOnset::default(),
        }
    }
}

impl InjectionParams {
    /// # Errors
    /// Returns [`RecallError::Injection`] when prevalence is outside `[0, 1]`, the delay
    /// window is inverted, or the risk weights cannot form a distribution.
    pub fn validate(&self) -> Result<(), RecallError> {
        if !(0.0..=1.0).contains(&self.prevalence) {
            return Err(RecallError::Injection(format!(
                "prevalence MUST be within [0.0, 1.0], got {}",
                self.prevalence
            )));
        }

        if self.delay_min_days > self.delay_max_days {
            return Err(RecallError::Injection(format!(
                "delay window is invalid: min {} days > max {} days",
                self.delay_min_days, self.delay_max_days
            )));
        }

        self.risk_distribution().map(|_| ())
    }

    fn risk_distribution(&self) -> Result<WeightedIndex<f64>, RecallError> {
        let weights = [self.risk_weights.low, self.risk_weights.medium, self.risk_weights.high];
        if weights.iter().any(|weight| !weight.is_finite()) {
            return Err(RecallError::Injection("risk weights MUST be finite".to_string()));
        }
        WeightedIndex::new(weights)
            .map_err(|err| RecallError::Injection(format!("risk weights are invalid: {err}")))
    }

    fn sample_size(&self, pool: usize) -> usize {
        if self.prevalence <= 0.0 || pool == 0 {
            return 0;
        }
        let scaled = (self.prevalence * usize_to_f64(pool)).round();
        f64_to_usize(scaled).clamp(1, pool)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn f64_to_usize(value: f64) -> usize {
    value as usize
}

/// Select contaminated source units and schedule their detection.
///
/// Events are ordered by source identifier and numbered from `EV-0001`.
///
/// # Errors
/// Returns [`RecallError::Injection`] when [`InjectionParams::validate`] fails, when a
/// positive prevalence meets a graph without eligible source units, or when a detection
/// delay pushes confirmation past the supported calendar range.
pub fn inject_contamination<R>(
    graph: &LineageGraph,
    params: &InjectionParams,
    rng: &mut R,
) -> Result<Vec<ContaminationEvent>, RecallError>
where
    R: Rng + ?Sized,
{
    params.validate()?;
    let risk_distribution = params.risk_distribution()?;

    let mut pool: Vec<&ProductionUnit> =
        graph.units().iter().filter(|unit| params.source_level.admits(unit.kind)).collect();
    pool.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));

    if params.prevalence > 0.0 && pool.is_empty() {
        return Err(RecallError::Injection(format!(
            "graph has no source units at level {:?}",
            params.source_level
        )));
    }

    let mut picked = rand::seq::index::sample(rng, pool.len(), params.sample_size(pool.len()))
        .into_vec();
    picked.sort_unstable();

    let horizon_end = graph.horizon_end();
    let mut events = Vec::with_capacity(picked.len());
    for (ordinal, position) in picked.into_iter().enumerate() {
        let source = pool[position];
        let contaminated_at = match params.onset {
            ContaminationOnset::AtProduction => source.produced_at,
            ContaminationOnset::WithinHorizon => {
                let span = (horizon_end - source.produced_at).whole_seconds().max(0);
                source.produced_at + Duration::seconds(rng.gen_range(0..=span))
            }
        };
        let delay_days = rng.gen_range(params.delay_min_days..=params.delay_max_days);
        let risk = RiskLevel::ALL[risk_distribution.sample(rng)];
        let Some(confirmed_at) =
            contaminated_at.checked_add(Duration::days(i64::from(delay_days)))
        else {
            return Err(RecallError::Injection(format!(
                "detection delay of {delay_days} days for {} leaves the supported calendar range",
                source.id
            )));
        };

        events.push(ContaminationEvent {
            event_id: format!("EV-{:04}", ordinal + 1),
            source: source.id.clone(),
            contaminated_at,
            confirmed_at,
            detection_delay_days: delay_days,
            risk,
        });
    }

    tracing::debug!(
        pool = pool.len(),
        injected = events.len(),
        prevalence = params.prevalence,
        "injected contamination events"
    );
    Ok(events)
}

/// Inject contamination using a fresh generator seeded with `seed`.
///
/// # Errors
/// See [`inject_contamination`].
pub fn generate_contamination(
    graph: &LineageGraph,
    params: &InjectionParams,
    seed: u64,
) -> Result<Vec<ContaminationEvent>, RecallError> {
    let mut rng = StdRng::seed_from_u64(seed);
    inject_contamination(graph, params, &mut rng)
}
