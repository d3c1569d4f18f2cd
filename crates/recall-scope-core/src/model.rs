use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Farm,
    MilkLot,
    CheeseBatch,
    DistributionUnit,
}

impl UnitKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Farm => "farm",
            Self::MilkLot => "milk_lot",
            Self::CheeseBatch => "cheese_batch",
            Self::DistributionUnit => "distribution_unit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "farm" => Some(Self::Farm),
            "milk_lot" => Some(Self::MilkLot),
            "cheese_batch" => Some(Self::CheeseBatch),
            "distribution_unit" => Some(Self::DistributionUnit),
            _ => None,
        }
    }

    /// Whether contamination events may originate at this kind of unit.
    #[must_use]
    pub fn is_source(self) -> bool {
        matches!(self, Self::Farm | Self::MilkLot)
    }
}

/// One node of the lineage graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductionUnit {
    pub id: UnitId,
    pub kind: UnitKind,
    #[serde(with = "time::serde::rfc3339")]
    pub produced_at: OffsetDateTime,
    pub line_id: Option<String>,
    #[serde(default)]
    pub parents: Vec<UnitId>,
    #[serde(default)]
    pub volume_liters: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub const ALL: [Self; 3] = [Self::Low, Self::Medium, Self::High];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContaminationEvent {
    pub event_id: String,
    pub source: UnitId,
    #[serde(with = "time::serde::rfc3339")]
    pub contaminated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub confirmed_at: OffsetDateTime,
    pub detection_delay_days: u32,
    pub risk: RiskLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Baseline,
    TraceForward,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::TraceForward => "trace_forward",
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distribution units one strategy flags for a single event.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecallScope {
    pub event_id: String,
    pub strategy: Strategy,
    pub units: BTreeSet<UnitId>,
    /// Cheese batches on the contaminated lineage of a high-risk event.
    #[serde(default)]
    pub quarantined_batches: BTreeSet<UnitId>,
}

impl RecallScope {
    #[must_use]
    pub fn empty(event_id: &str, strategy: Strategy) -> Self {
        Self {
            event_id: event_id.to_string(),
            strategy,
            units: BTreeSet::new(),
            quarantined_batches: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Explicit union of scopes; resolvers never merge scopes across events on their own.
#[must_use]
pub fn union_scopes<'a, I>(scopes: I) -> BTreeSet<UnitId>
where
    I: IntoIterator<Item = &'a RecallScope>,
{
    scopes.into_iter().flat_map(|scope| scope.units.iter().cloned()).collect()
}
