//! Job configuration.
//!
//! All knobs are resolved programmatically through the builder; there is
//! no config file surface.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Validated configuration for one batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name; prefixes the run directory
    pub name: String,

    /// Concurrency scales with the chain's fan-in product:
    /// `max_concurrent_records = pipeline_fan_in * concurrency_multiplier`
    #[serde(default = "default_multiplier")]
    pub concurrency_multiplier: usize,

    /// Directory under which run directories are created
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Upper bound on per-record detail entries in the resume summary
    #[serde(default = "default_detail_limit")]
    pub summary_detail_limit: usize,

    /// Show a terminal spinner while the job runs
    #[serde(default)]
    pub progress: bool,
}

fn default_multiplier() -> usize {
    1
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_detail_limit() -> usize {
    10_000
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency_multiplier: default_multiplier(),
            root_dir: default_root_dir(),
            summary_detail_limit: default_detail_limit(),
            progress: false,
        }
    }
}
