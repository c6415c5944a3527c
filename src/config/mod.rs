mod loader;
mod schema;

pub use loader::{load_config, parse_config, save_config, STATE_DIR_ENV};
pub use schema::*;

use anyhow::Result;
use std::path::Path;

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        loader::load_config(path)
    }

    pub fn save(&self) -> Result<()> {
        loader::save_config(self)
    }

    pub fn default_path() -> std::path::PathBuf {
        default_state_dir().join("sandbox.yaml")
    }
}
