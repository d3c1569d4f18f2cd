use std::ffi::OsStr;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const SMALL_GRAPH: [&str; 10] = [
    "--farms",
    "4",
    "--milk-lots-per-farm",
    "10",
    "--cheese-batches",
    "20",
    "--horizon-days",
    "6",
    "--prevalence",
    "0.2",
];

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rscope<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rscope"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rscope binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rscope(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rscope command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn small_args<'a>(command: &[&'a str]) -> Vec<&'a str> {
    let mut args = command.to_vec();
    args.extend(SMALL_GRAPH);
    args
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path is not UTF-8: {}", path.display()))
}

fn as_u64(value: &Value, pointer: &str) -> u64 {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

fn as_f64(value: &Value, pointer: &str) -> f64 {
    value
        .pointer(pointer)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing number at `{pointer}` in payload: {value}"))
}

fn assert_failure_mentions(output: &Output, expected: &str) {
    assert!(!output.status.success(), "command should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(expected), "stderr did not mention `{expected}`:\n{stderr}");
}

#[test]
fn config_show_merges_file_and_flag_overrides() {
    let sandbox = unique_temp_dir("rscope-config-show");
    let config_path = sandbox.join("experiment.yaml");
    fs::write(&config_path, "seed: 3\ngraph:\n  farms: 6\nrecall:\n  window_hours: 12\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config_path.display()));

    let shown = run_json([
        "--config",
        path_str(&config_path),
        "config",
        "show",
        "--mixing-k",
        "3",
    ]);

    assert_eq!(shown.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    assert_eq!(as_u64(&shown, "/config/seed"), 3);
    assert_eq!(as_u64(&shown, "/config/graph/farms"), 6);
    assert_eq!(as_u64(&shown, "/config/graph/mixing_k"), 3);
    assert_eq!(as_u64(&shown, "/config/graph/milk_lots_per_farm"), 36);
    assert_eq!(as_u64(&shown, "/config/recall/window_hours"), 12);
    assert!(shown.get("run_id").and_then(Value::as_str).is_some_and(|id| id.starts_with("run_")));

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup {}: {err}", sandbox.display()));
}

#[test]
fn run_is_deterministic_for_the_same_seed() {
    let first = run_json(small_args(&["run", "--seed", "21", "--rows"]));
    let second = run_json(small_args(&["run", "--seed", "21", "--rows"]));
    assert_eq!(first, second);

    let other = run_json(small_args(&["run", "--seed", "22", "--rows"]));
    assert_ne!(first.get("run_id"), other.get("run_id"));

    assert_eq!(as_u64(&first, "/units/milk_lot"), 40);
    assert_eq!(as_u64(&first, "/units/distribution_unit"), 80);
    assert_eq!(as_u64(&first, "/summary/events"), 8);
    assert_eq!(first.pointer("/rows").and_then(Value::as_array).map(Vec::len), Some(16));
    assert_eq!(
        first.pointer("/summary/strategies/1/strategy").and_then(Value::as_str),
        Some("trace_forward")
    );
    assert!((as_f64(&first, "/summary/strategies/1/precision/mean") - 1.0).abs() < 1e-12);
    assert!((as_f64(&first, "/summary/strategies/1/recall/mean") - 1.0).abs() < 1e-12);
    assert_eq!(first.get("tables"), Some(&Value::Null));
}

#[test]
fn run_writes_reproducible_tables() {
    let sandbox = unique_temp_dir("rscope-run-tables");
    let out_a = sandbox.join("a");
    let out_b = sandbox.join("b");

    let run_a = run_json(small_args(&["run", "--out", path_str(&out_a)]));
    let run_b = run_json(small_args(&["run", "--out", path_str(&out_b)]));

    for name in [
        "production_units.ndjson",
        "contamination_events.ndjson",
        "recall_results.ndjson",
        "summary.json",
        "manifest.json",
    ] {
        assert!(out_a.join(name).exists(), "missing {name}");
    }
    assert_eq!(run_a.pointer("/tables/files"), run_b.pointer("/tables/files"));
    assert_eq!(
        run_a.pointer("/tables/files").and_then(Value::as_array).map(Vec::len),
        Some(4)
    );

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup {}: {err}", sandbox.display()));
}

#[test]
fn evaluate_on_generated_tables_matches_run() {
    let sandbox = unique_temp_dir("rscope-generate-evaluate");
    let dataset = sandbox.join("dataset");

    let generated = run_json(small_args(&["generate", "--out", path_str(&dataset)]));
    assert_eq!(as_u64(&generated, "/events"), 8);
    assert_eq!(as_u64(&generated, "/units/cheese_batch"), 20);

    let evaluated = run_json(["evaluate", "--in", path_str(&dataset)]);
    let ran = run_json(small_args(&["run"]));
    assert_eq!(evaluated.get("summary"), ran.get("summary"));
    assert!(evaluated
        .get("run_id")
        .and_then(Value::as_str)
        .is_some_and(|id| id.starts_with("eval_")));

    let wide = run_json(["evaluate", "--in", path_str(&dataset), "--window-hours", "96"]);
    assert_eq!(as_u64(&wide, "/summary/window_hours"), 96);
    assert!(
        as_f64(&wide, "/summary/strategies/0/scope_size/mean")
            >= as_f64(&evaluated, "/summary/strategies/0/scope_size/mean")
    );

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup {}: {err}", sandbox.display()));
}

#[test]
fn trace_lists_milk_lots_and_farms_behind_a_batch() {
    let sandbox = unique_temp_dir("rscope-trace");
    let dataset = sandbox.join("dataset");
    let _generated = run_json(small_args(&["generate", "--out", path_str(&dataset)]));

    let traced = run_json(["trace", "--in", path_str(&dataset), "--unit", "CB-000001"]);
    assert_eq!(traced.pointer("/unit/kind").and_then(Value::as_str), Some("cheese_batch"));
    let milk_lots = traced
        .get("milk_lots")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("milk_lots missing in payload: {traced}"));
    let farms = traced
        .get("farms")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("farms missing in payload: {traced}"));
    assert_eq!(milk_lots.len(), 4);
    assert!((1..=4).contains(&farms.len()));

    let generated_graph = run_json(small_args(&["trace", "--unit", "CB-000001"]));
    assert_eq!(generated_graph, traced);

    let output = run_rscope(["trace", "--in", path_str(&dataset), "--unit", "CB-999999"]);
    assert_failure_mentions(&output, "unit CB-999999 does not exist");

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup {}: {err}", sandbox.display()));
}

#[test]
fn evaluate_rejects_tampered_tables() {
    let sandbox = unique_temp_dir("rscope-tampered");
    let dataset = sandbox.join("dataset");
    let _generated = run_json(small_args(&["generate", "--out", path_str(&dataset)]));

    let units_path = dataset.join("production_units.ndjson");
    let mut tampered = fs::OpenOptions::new()
        .append(true)
        .open(&units_path)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", units_path.display()));
    writeln!(tampered, "{{\"tampered\":true}}")
        .unwrap_or_else(|err| panic!("failed to tamper {}: {err}", units_path.display()));

    let output = run_rscope(["evaluate", "--in", path_str(&dataset)]);
    assert_failure_mentions(&output, "manifest digest mismatch for production_units.ndjson");

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup {}: {err}", sandbox.display()));
}

#[test]
fn invalid_configuration_exits_non_zero() {
    let output = run_rscope(["run", "--mixing-k", "0"]);
    assert_failure_mentions(&output, "mixing_k MUST be positive");

    let output = run_rscope(["run", "--delay-min-days", "9", "--delay-max-days", "2"]);
    assert_failure_mentions(&output, "delay window is invalid");

    let output = run_rscope(["run", "--horizon-days", "5000000"]);
    assert_failure_mentions(&output, "horizon_days=5000000 moves the timeline");

    let output = run_rscope(["run", "--window-hours", "4294967295"]);
    assert_failure_mentions(&output, "window_hours=4294967295");

    let output = run_rscope(["run", "--dilution-threshold", "1.5"]);
    assert_failure_mentions(&output, "dilution_threshold MUST be within");

    let sandbox = unique_temp_dir("rscope-invalid-config");
    let config_path = sandbox.join("bad.yaml");
    fs::write(&config_path, "contamination:\n  prevalence: 1.5\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config_path.display()));
    let output = run_rscope(["--config", path_str(&config_path), "config", "show"]);
    assert_failure_mentions(&output, "prevalence MUST be within");

    fs::remove_dir_all(&sandbox)
        .unwrap_or_else(|err| panic!("failed to cleanup {}: {err}", sandbox.display()));
}
