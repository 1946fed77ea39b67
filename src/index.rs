use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Outputs and main-halo numbers along the main progenitor branch, earliest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MainBranch {
    pub outputs: Vec<String>,
    pub halonums: Vec<u64>,
}

/// Merger-tree queries needed to walk the main progenitor of a halo.
pub trait IndexingProvider {
    /// Main-branch outputs and halo numbers in chronological order.
    fn main_branch(&self) -> Result<MainBranch>;
    /// Cosmic time (Gyr) of each main-branch progenitor, latest first.
    fn progenitor_times(&self) -> Result<Vec<f64>>;
    /// Redshift of each main-branch progenitor, latest first.
    fn progenitor_redshifts(&self) -> Result<Vec<f64>>;
    /// The halo's r200c (kpc) as stored in the database, if any.
    fn halo_r200c(&self, output: &str, halonum: u64) -> Option<f64>;
}

/// On-disk export of a halo database for one simulation and halo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgenitorIndexFile {
    pub simulation: String,
    #[serde(default = "default_halo_number")]
    pub halo_number: u64,
    pub outputs: Vec<String>,
    pub halonums: Vec<u64>,
    pub progenitor_t: Vec<f64>,
    pub progenitor_z: Vec<f64>,
    /// r200c keyed by output name.
    #[serde(default)]
    pub r200c: BTreeMap<String, f64>,
}

fn default_halo_number() -> u64 {
    1
}

/// [`IndexingProvider`] backed by a JSON export under the database directory.
#[derive(Debug, Clone)]
pub struct JsonProgenitorIndex {
    data: ProgenitorIndexFile,
}

impl JsonProgenitorIndex {
    /// Database file for a simulation: `<tangos_path>/<prefix>.json`, where the
    /// prefix is the part of the simulation name before the first `_`.
    pub fn path_for(tangos_path: &Path, sim_name: &str) -> PathBuf {
        let prefix = sim_name.split('_').next().unwrap_or(sim_name);
        tangos_path.join(format!("{}.json", prefix))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read progenitor index '{}'", path.display()))?;
        let data: ProgenitorIndexFile = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse progenitor index '{}'", path.display()))?;
        if data.outputs.len() != data.halonums.len() {
            anyhow::bail!(
                "progenitor index '{}' lists {} outputs but {} halo numbers",
                path.display(),
                data.outputs.len(),
                data.halonums.len()
            );
        }
        info!(
            "Loaded progenitor index for {} (halo {}): {} outputs",
            data.simulation,
            data.halo_number,
            data.outputs.len()
        );
        Ok(JsonProgenitorIndex { data })
    }

    pub fn from_data(data: ProgenitorIndexFile) -> Self {
        JsonProgenitorIndex { data }
    }

    pub fn simulation(&self) -> &str {
        &self.data.simulation
    }

    /// Halo number of the main branch at the latest output.
    pub fn halo_number(&self) -> u64 {
        self.data.halo_number
    }
}

impl IndexingProvider for JsonProgenitorIndex {
    fn main_branch(&self) -> Result<MainBranch> {
        Ok(MainBranch { outputs: self.data.outputs.clone(), halonums: self.data.halonums.clone() })
    }

    fn progenitor_times(&self) -> Result<Vec<f64>> {
        Ok(self.data.progenitor_t.clone())
    }

    fn progenitor_redshifts(&self) -> Result<Vec<f64>> {
        Ok(self.data.progenitor_z.clone())
    }

    fn halo_r200c(&self, output: &str, _halonum: u64) -> Option<f64> {
        self.data.r200c.get(output).copied()
    }
}
