//! Lineage model and recall-scope resolution for a synthetic dairy supply chain.
//!
//! Data flows strictly forward: [`generate_lineage_graph`] builds the production DAG,
//! [`generate_contamination`] injects contamination events, the [`RecallResolver`]
//! implementations turn each event into a [`RecallScope`], and [`run_experiment`] scores
//! both strategies against [`ground_truth`].

mod experiment;
mod graph;
mod inject;
mod metrics;
mod model;
mod resolve;

pub use experiment::{
    run_experiment, ExperimentReport, ExperimentSummary, RecallParams, RecallResultRow,
    StrategySummary,
};
pub use graph::{
    build_lineage_graph, generate_lineage_graph, GraphParams, LineageGraph, MAX_LOT_VOLUME_LITERS,
    MIN_LOT_VOLUME_LITERS,
};
pub use inject::{
    generate_contamination, inject_contamination, ContaminationOnset, InjectionParams,
    RiskWeights, SourceLevel,
};
pub use metrics::{
    ground_truth, percentile, precision, recall, score_scope, scope_reduction, summarize,
    MetricSummary, ScopeMetrics,
};
pub use model::{
    union_scopes, ContaminationEvent, ProductionUnit, RecallScope, RiskLevel, Strategy, UnitId,
    UnitKind,
};
pub use resolve::{BaselineResolver, RecallResolver, TraceForwardResolver};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecallError {
    #[error("graph construction error: {0}")]
    GraphConstruction(String),
    #[error("injection error: {0}")]
    Injection(String),
    #[error("resolution error: {0}")]
    Resolution(String),
}
