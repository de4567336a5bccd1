use crate::distances::DistanceTransform;
use crate::partition::{Topology, TopologyError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable TOML format of a solver run.

/// How the weight file named by `weight_matrix_file` is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightMode {
    /// A quantized binary matrix with the same layout as the distance matrix.
    #[default]
    Matrix,
    /// One weight per point, one per line; `w_ij = s_i * s_j`.
    Simple,
    /// A quantized binary matrix, run-length compressed per row once loaded.
    Rle,
}

/// Every parameter of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub number_data_points: usize,
    pub target_dimension: usize,

    /// Cooling factor applied to the temperature after every temperature loop.
    #[serde(default = "defaults::alpha")]
    pub alpha: f64,
    /// `Tmin = t_min_factor * min positive distance / sqrt(2 D)`.
    #[serde(default = "defaults::t_min_factor")]
    pub t_min_factor: f64,
    /// SMACOF iterations at one temperature stop once stress improves by less than this.
    #[serde(default = "defaults::threshold")]
    pub threshold: f64,
    #[serde(default = "defaults::cg_iter")]
    pub cg_iter: usize,
    #[serde(default = "defaults::cg_error_threshold")]
    pub cg_error_threshold: f64,
    /// Iteration number from which every SMACOF iteration is logged.
    #[serde(default = "defaults::stress_iter")]
    pub stress_iter: usize,
    /// Stops after this many temperature loops when positive.
    #[serde(default)]
    pub max_temp_loops: usize,

    #[serde(default)]
    pub distance_transform: DistanceTransform,
    #[serde(default)]
    pub is_sammon: bool,
    /// The matrix files hold a base matrix of `number_data_points / repetitions` rows.
    #[serde(default = "defaults::repetitions")]
    pub repetitions: usize,
    #[serde(default = "defaults::block_size")]
    pub block_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_matrix_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_matrix_file: Option<PathBuf>,
    #[serde(default)]
    pub weight_mode: WeightMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_points_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_file: Option<PathBuf>,
    #[serde(default = "defaults::big_endian")]
    pub big_endian: bool,

    #[serde(default = "defaults::one")]
    pub process_count: usize,
    #[serde(default = "defaults::one")]
    pub threads_per_process: usize,
    #[serde(default = "defaults::one")]
    pub procs_per_node: usize,
    /// Directory for the file-backed node regions; anonymous memory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_region_dir: Option<PathBuf>,
    /// Seed of the random initial mapping.
    #[serde(default)]
    pub seed: u64,
}

mod defaults {
    pub fn alpha() -> f64 {
        0.95
    }
    pub fn t_min_factor() -> f64 {
        0.5
    }
    pub fn threshold() -> f64 {
        1e-6
    }
    pub fn cg_iter() -> usize {
        20
    }
    pub fn cg_error_threshold() -> f64 {
        1.0
    }
    pub fn stress_iter() -> usize {
        10_000
    }
    pub fn repetitions() -> usize {
        1
    }
    pub fn block_size() -> usize {
        64
    }
    pub fn big_endian() -> bool {
        true
    }
    pub fn one() -> usize {
        1
    }
}

/// Custom error type for loading and validating a run configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

impl SolverConfig {
    /// A configuration with every optional parameter at its default.
    pub fn new(number_data_points: usize, target_dimension: usize) -> Self {
        Self {
            number_data_points,
            target_dimension,
            alpha: defaults::alpha(),
            t_min_factor: defaults::t_min_factor(),
            threshold: defaults::threshold(),
            cg_iter: defaults::cg_iter(),
            cg_error_threshold: defaults::cg_error_threshold(),
            stress_iter: defaults::stress_iter(),
            max_temp_loops: 0,
            distance_transform: DistanceTransform::Identity,
            is_sammon: false,
            repetitions: defaults::repetitions(),
            block_size: defaults::block_size(),
            distance_matrix_file: None,
            weight_matrix_file: None,
            weight_mode: WeightMode::Matrix,
            initial_points_file: None,
            points_file: None,
            label_file: None,
            big_endian: defaults::big_endian(),
            process_count: 1,
            threads_per_process: 1,
            procs_per_node: 1,
            shared_region_dir: None,
            seed: 0,
        }
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml(&toml_string)
    }

    pub fn from_toml(toml_string: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_data_points == 0 {
            return Err(invalid("number_data_points", "must be positive"));
        }
        if self.target_dimension == 0 {
            return Err(invalid("target_dimension", "must be positive"));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(invalid("alpha", format!("{} is outside (0, 1)", self.alpha)));
        }
        if !(self.t_min_factor > 0.0) {
            return Err(invalid("t_min_factor", "must be positive"));
        }
        if !(self.threshold > 0.0) {
            return Err(invalid("threshold", "must be positive"));
        }
        if !(self.cg_error_threshold > 0.0) {
            return Err(invalid("cg_error_threshold", "must be positive"));
        }
        if self.block_size == 0 {
            return Err(invalid("block_size", "must be positive"));
        }
        if self.repetitions == 0 || self.number_data_points % self.repetitions != 0 {
            return Err(invalid(
                "repetitions",
                format!(
                    "{} does not divide {} points",
                    self.repetitions, self.number_data_points
                ),
            ));
        }
        if self.process_count == 0 || self.threads_per_process == 0 || self.procs_per_node == 0 {
            return Err(invalid(
                "process_count",
                "process, thread and per-node counts must be positive",
            ));
        }
        if self.process_count % self.procs_per_node != 0 {
            return Err(invalid(
                "procs_per_node",
                format!(
                    "{} processes cannot be grouped into nodes of {}",
                    self.process_count, self.procs_per_node
                ),
            ));
        }
        if self.weight_mode == WeightMode::Simple && self.weight_matrix_file.is_none() {
            return Err(invalid("weight_matrix_file", "simple weights need a weight file"));
        }
        if let Some(dir) = &self.shared_region_dir {
            if !dir.is_dir() {
                return Err(invalid(
                    "shared_region_dir",
                    format!("{} is not a directory", dir.display()),
                ));
            }
        }
        Ok(())
    }

    pub fn topology(&self) -> Result<Topology, TopologyError> {
        Topology::new(
            self.number_data_points,
            self.target_dimension,
            self.process_count,
            self.threads_per_process,
            self.procs_per_node,
        )
    }

    /// Rows of the base matrix stored in the input files.
    pub fn base_points(&self) -> usize {
        self.number_data_points / self.repetitions.max(1)
    }
}
