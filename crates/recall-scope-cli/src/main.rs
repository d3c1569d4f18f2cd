mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use recall_scope_core::{
    generate_contamination, generate_lineage_graph, run_experiment, ContaminationEvent,
    ExperimentReport, LineageGraph, RecallParams, UnitId, UnitKind,
};
use recall_scope_tables::{export_tables, import_dataset, read_table_manifest, TableManifest};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use crate::config::{resolve_config, ConfigOverrides, ExperimentConfig};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rscope")]
#[command(about = "Dairy recall scope simulator")]
struct Cli {
    /// YAML configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, default_value_t = false)]
    quiet: bool,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Build a lineage graph, inject contamination, and write the dataset tables.
    Generate(GenerateArgs),
    /// Generate a dataset and compare both recall strategies on it.
    Run(RunArgs),
    /// Compare both recall strategies on a previously generated dataset.
    Evaluate(EvaluateArgs),
    /// List the milk lots and farms upstream of a unit.
    Trace(TraceArgs),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    out: Option<PathBuf>,
    /// Include every (event, strategy) row in the printed report.
    #[arg(long, default_value_t = false)]
    rows: bool,
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    rows: bool,
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[arg(long)]
    unit: String,
    /// Dataset directory; the configured graph is generated when omitted.
    #[arg(long = "in")]
    input: Option<PathBuf>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = resolve_config(cli.config.as_deref(), &cli.overrides)?;
    match cli.command {
        Command::Config { command: ConfigCommand::Show } => run_config_show(&config),
        Command::Generate(args) => run_generate(&args, &config),
        Command::Run(args) => run_run(&args, &config),
        Command::Evaluate(args) => run_evaluate(&args, &config.recall),
        Command::Trace(args) => run_trace(&args, &config),
    }
}

fn run_config_show(config: &ExperimentConfig) -> Result<()> {
    emit_json(serde_json::json!({
        "run_id": config.run_id()?,
        "injection_seed": config.injection_seed(),
        "config": config
    }))
}

fn run_generate(args: &GenerateArgs, config: &ExperimentConfig) -> Result<()> {
    let run_id = config.run_id()?;
    let (graph, events) = generate_dataset(config)?;
    let manifest = export_tables(&args.out, &graph, &events, None, Some(&run_id))?;

    emit_json(serde_json::json!({
        "run_id": run_id,
        "out": args.out.display().to_string(),
        "units": unit_counts(&graph),
        "events": events.len(),
        "manifest": manifest
    }))
}

fn run_run(args: &RunArgs, config: &ExperimentConfig) -> Result<()> {
    let run_id = config.run_id()?;
    let (graph, events) = generate_dataset(config)?;
    let report = run_experiment(&graph, &events, &config.recall)
        .context("failed to evaluate recall strategies")?;

    let manifest = match args.out.as_deref() {
        Some(out) => Some(export_tables(out, &graph, &events, Some(&report), Some(&run_id))?),
        None => None,
    };

    emit_report(&run_id, &graph, &report, args.rows, manifest.as_ref())
}

fn run_evaluate(args: &EvaluateArgs, recall: &RecallParams) -> Result<()> {
    let dataset = import_dataset(&args.input)?;
    let run_id = evaluation_id(&args.input, recall)?;
    let report = run_experiment(&dataset.graph, &dataset.events, recall)
        .context("failed to evaluate recall strategies")?;

    let manifest = match args.out.as_deref() {
        Some(out) => Some(export_tables(
            out,
            &dataset.graph,
            &dataset.events,
            Some(&report),
            Some(&run_id),
        )?),
        None => None,
    };

    emit_report(&run_id, &dataset.graph, &report, args.rows, manifest.as_ref())
}

fn run_trace(args: &TraceArgs, config: &ExperimentConfig) -> Result<()> {
    let graph = match args.input.as_deref() {
        Some(input) => import_dataset(input)?.graph,
        None => generate_lineage_graph(&config.graph, config.seed)
            .context("failed to build lineage graph")?,
    };
    let unit_id = UnitId::new(args.unit.as_str());
    let Some(unit) = graph.get(&unit_id) else {
        anyhow::bail!("unit {unit_id} does not exist in the lineage graph");
    };
    let sources = graph.trace_back(&unit_id)?;

    emit_json(serde_json::json!({
        "unit": unit,
        "milk_lots": sources
            .iter()
            .filter(|source| source.kind == UnitKind::MilkLot)
            .map(|source| &source.id)
            .collect::<Vec<_>>(),
        "farms": sources
            .iter()
            .filter(|source| source.kind == UnitKind::Farm)
            .map(|source| &source.id)
            .collect::<Vec<_>>()
    }))
}

fn generate_dataset(
    config: &ExperimentConfig,
) -> Result<(LineageGraph, Vec<ContaminationEvent>)> {
    let graph = generate_lineage_graph(&config.graph, config.seed)
        .context("failed to build lineage graph")?;
    let events = generate_contamination(&graph, &config.contamination, config.injection_seed())
        .context("failed to inject contamination")?;
    Ok((graph, events))
}

fn emit_report(
    run_id: &str,
    graph: &LineageGraph,
    report: &ExperimentReport,
    include_rows: bool,
    manifest: Option<&TableManifest>,
) -> Result<()> {
    let mut payload = serde_json::json!({
        "run_id": run_id,
        "units": unit_counts(graph),
        "summary": report.summary,
        "tables": manifest
    });
    if include_rows {
        payload["rows"] =
            serde_json::to_value(&report.rows).context("failed to serialize result rows")?;
    }
    emit_json(payload)
}

fn unit_counts(graph: &LineageGraph) -> BTreeMap<&'static str, usize> {
    [UnitKind::Farm, UnitKind::MilkLot, UnitKind::CheeseBatch, UnitKind::DistributionUnit]
        .into_iter()
        .map(|kind| (kind.as_str(), graph.units_of_kind(kind).count()))
        .collect()
}

/// Identifier of an evaluation: the imported table digests plus the recall parameters.
fn evaluation_id(input: &Path, recall: &RecallParams) -> Result<String> {
    let manifest = read_table_manifest(input)?;
    let mut hasher = Sha256::new();
    for file in &manifest.files {
        hasher.update(file.path.as_bytes());
        hasher.update(file.sha256.as_bytes());
    }
    hasher.update(serde_json::to_vec(recall).context("failed to serialize recall parameters")?);

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    Ok(format!("eval_{}", &digest_hex[..16]))
}
