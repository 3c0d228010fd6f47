use std::path::PathBuf;

use clap::Args;
use serde::Deserialize;

const DEFAULT_ROOT: &str = "./filing-data";

/// Local backend settings.
#[derive(Args, Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding one file per record
    #[arg(long = "local-root", default_value = DEFAULT_ROOT, env = "FILING_LOCAL_ROOT")]
    pub root: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
        }
    }
}
