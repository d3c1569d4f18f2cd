use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use recall_scope_core::{GraphParams, InjectionParams, RecallParams};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_SEED: u64 = 7;

/// Mixed into the experiment seed so contamination draws are independent of graph draws.
const INJECTION_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Everything one experiment run depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub seed: u64,
    pub graph: GraphParams,
    pub contamination: InjectionParams,
    pub recall: RecallParams,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            graph: GraphParams::default(),
            contamination: InjectionParams::default(),
            recall: RecallParams::default(),
        }
    }
}

/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    #[arg(long, global = true)]
    pub seed: Option<u64>,
    #[arg(long, global = true)]
    pub farms: Option<u32>,
    #[arg(long, global = true)]
    pub milk_lots_per_farm: Option<u32>,
    #[arg(long, global = true)]
    pub cheese_batches: Option<u32>,
    #[arg(long, global = true)]
    pub mixing_k: Option<u32>,
    #[arg(long, global = true)]
    pub horizon_days: Option<u32>,
    #[arg(long, global = true)]
    pub prevalence: Option<f64>,
    #[arg(long, global = true)]
    pub delay_min_days: Option<u32>,
    #[arg(long, global = true)]
    pub delay_max_days: Option<u32>,
    #[arg(long, global = true)]
    pub window_hours: Option<u32>,
    #[arg(long, global = true)]
    pub dilution_threshold: Option<f64>,
}

impl ExperimentConfig {
    /// Load the YAML file at `path`, or the defaults when no file is given.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        fn set<T: Copy>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }

        set(&mut self.seed, overrides.seed);
        set(&mut self.graph.farms, overrides.farms);
        set(&mut self.graph.milk_lots_per_farm, overrides.milk_lots_per_farm);
        set(&mut self.graph.cheese_batches, overrides.cheese_batches);
        set(&mut self.graph.mixing_k, overrides.mixing_k);
        set(&mut self.graph.horizon_days, overrides.horizon_days);
        set(&mut self.contamination.prevalence, overrides.prevalence);
        set(&mut self.contamination.delay_min_days, overrides.delay_min_days);
        set(&mut self.contamination.delay_max_days, overrides.delay_max_days);
        set(&mut self.recall.window_hours, overrides.window_hours);
        set(&mut self.recall.dilution_threshold, overrides.dilution_threshold);
    }

    /// # Errors
    /// Returns the first graph, contamination, or recall parameter violation.
    pub fn validate(&self) -> Result<()> {
        self.graph.validate().context("invalid graph configuration")?;
        self.contamination.validate().context("invalid contamination configuration")?;
        self.recall.validate().context("invalid recall configuration")?;
        Ok(())
    }

    #[must_use]
    pub fn injection_seed(&self) -> u64 {
        self.seed ^ INJECTION_SEED_SALT
    }

    /// Stable identifier of this configuration, `run_` followed by 16 hex digits.
    ///
    /// # Errors
    /// Returns an error when the configuration cannot be serialized.
    pub fn run_id(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self).context("failed to serialize configuration")?;
        let digest = Sha256::digest(&bytes);
        let digest_hex = format!("{digest:x}");
        Ok(format!("run_{}", &digest_hex[..16]))
    }
}

/// Load, override, and validate the effective configuration.
///
/// # Errors
/// Returns an error when loading or validation fails.
pub fn resolve_config(
    path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<ExperimentConfig> {
    let mut config = ExperimentConfig::load(path)?;
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}
