use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::run_params::RunParams;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// Filesystem locations of the halo database, particle data and optional overrides
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PathsConfig {
    pub tangos_path: PathBuf,
    pub pynbody_path: PathBuf,
    // Empty string means "no manual halo numbers", fall back to the HOP catalogue
    #[serde(default)]
    pub manual_halonum_path: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

// Parameters of the upstream angular-momentum tagger, recorded for provenance
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TaggingConfig {
    pub ftag: f64,
    #[serde(default = "default_tagging_method")]
    pub method: String,
}

fn default_tagging_method() -> String {
    "angular momentum recursive".to_string()
}

// Occupation-model settings used upstream when assigning stellar mass
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DarklightConfig {
    pub n: u32,
}

// Density-based clustering used to isolate the central stellar structure
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_eps")]
    pub eps: f64,
    // Mass-weighted: a point is core when its neighbourhood mass reaches this value
    #[serde(default = "default_min_samples")]
    pub min_samples: f64,
}

fn default_eps() -> f64 {
    0.05 // kpc
}

fn default_min_samples() -> f64 {
    2.0
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        ClusteringConfig { eps: default_eps(), min_samples: default_min_samples() }
    }
}

// Sub-halo exclusion
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChildrenConfig {
    // 1 = direct children only; 0 disables exclusion
    #[serde(default = "default_child_depth")]
    pub depth: u32,
}

fn default_child_depth() -> u32 {
    1
}

impl Default for ChildrenConfig {
    fn default() -> Self {
        ChildrenConfig { depth: default_child_depth() }
    }
}

/// Power-law fading of a single stellar population in one photometric band.
/// L/M(age) = (1 / ml_ref) * (age / age_ref_gyr)^(-alpha)
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BandParams {
    pub ml_ref: f64,
    pub age_ref_gyr: f64,
    pub alpha: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LuminosityConfig {
    #[serde(default = "default_band")]
    pub band: String,
    #[serde(default)]
    pub cylindrical: bool,
    #[serde(default = "default_min_age")]
    pub min_age_gyr: f64,
    #[serde(default = "default_bands")]
    pub bands: BTreeMap<String, BandParams>,
}

fn default_band() -> String {
    "v".to_string()
}

fn default_min_age() -> f64 {
    0.01
}

fn default_bands() -> BTreeMap<String, BandParams> {
    let mut bands = BTreeMap::new();
    bands.insert("b".to_string(), BandParams { ml_ref: 8.0, age_ref_gyr: 10.0, alpha: 1.0 });
    bands.insert("v".to_string(), BandParams { ml_ref: 5.0, age_ref_gyr: 10.0, alpha: 0.9 });
    bands.insert("i".to_string(), BandParams { ml_ref: 3.0, age_ref_gyr: 10.0, alpha: 0.7 });
    bands.insert("k".to_string(), BandParams { ml_ref: 1.0, age_ref_gyr: 10.0, alpha: 0.6 });
    bands
}

impl Default for LuminosityConfig {
    fn default() -> Self {
        LuminosityConfig {
            band: default_band(),
            cylindrical: false,
            min_age_gyr: default_min_age(),
            bands: default_bands(),
        }
    }
}

// Flat LCDM background used for the critical density
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
pub struct CosmologyConfig {
    pub h: f64,
    pub omega_m: f64,
    pub omega_lambda: f64,
}

impl Default for CosmologyConfig {
    fn default() -> Self {
        CosmologyConfig { h: 0.673, omega_m: 0.315, omega_lambda: 0.685 }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    Json,
    Bincode,
    MessagePack,
}

impl SnapshotFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Bincode => "bin",
            SnapshotFormat::MessagePack => "msgpack",
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_save_to_file")]
    pub save_to_file: bool,
    #[serde(default = "default_output_filename")]
    pub filename: String,
    #[serde(default = "default_snapshot_format")]
    pub snapshot_format: SnapshotFormat,
}

fn default_save_to_file() -> bool {
    true
}

fn default_output_filename() -> String {
    "reffs.csv".to_string()
}

fn default_snapshot_format() -> SnapshotFormat {
    SnapshotFormat::Json
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            save_to_file: default_save_to_file(),
            filename: default_output_filename(),
            snapshot_format: default_snapshot_format(),
        }
    }
}

// Main configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DarktraceConfig {
    pub paths: PathsConfig,
    pub tagging: TaggingConfig,
    pub darklight: DarklightConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub children: ChildrenConfig,
    #[serde(default)]
    pub luminosity: LuminosityConfig,
    #[serde(default)]
    pub cosmology: CosmologyConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl DarktraceConfig {
    /// Loads the configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: DarktraceConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.tagging.ftag > 0.0 && self.tagging.ftag <= 1.0) {
            anyhow::bail!("tagging.ftag must be in (0, 1], got {}", self.tagging.ftag);
        }
        if !(self.clustering.eps > 0.0) || !self.clustering.eps.is_finite() {
            anyhow::bail!("clustering.eps must be positive, got {}", self.clustering.eps);
        }
        if !(self.clustering.min_samples > 0.0) {
            anyhow::bail!("clustering.min_samples must be positive, got {}", self.clustering.min_samples);
        }
        if !self.luminosity.bands.contains_key(&self.luminosity.band) {
            anyhow::bail!(
                "luminosity.band '{}' has no fading parameters (known bands: {:?})",
                self.luminosity.band,
                self.luminosity.bands.keys().collect::<Vec<_>>()
            );
        }
        if self.cosmology.h <= 0.0 {
            anyhow::bail!("cosmology.h must be positive.");
        }
        Ok(())
    }

    /// Looks up one of the named path keys.
    pub fn get_path(&self, key: &str) -> Option<String> {
        self.all_paths().remove(key)
    }

    /// All configured paths keyed by name, in a stable order.
    pub fn all_paths(&self) -> BTreeMap<String, String> {
        let mut paths = BTreeMap::new();
        paths.insert("tangos_path".to_string(), self.paths.tangos_path.display().to_string());
        paths.insert("pynbody_path".to_string(), self.paths.pynbody_path.display().to_string());
        paths.insert("manual_halonum_path".to_string(), self.paths.manual_halonum_path.clone());
        if let Some(dir) = &self.paths.output_dir {
            paths.insert("output_dir".to_string(), dir.display().to_string());
        }
        paths
    }

    /// Manual halo-number override directory, if configured.
    pub fn manual_halonum_path(&self) -> Option<PathBuf> {
        if self.paths.manual_halonum_path.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.paths.manual_halonum_path))
        }
    }

    /// Converts the configuration into the parameters used while processing snapshots.
    pub fn run_params(&self) -> RunParams {
        // validate() guarantees the band exists
        let band_params = self
            .luminosity
            .bands
            .get(&self.luminosity.band)
            .copied()
            .unwrap_or(BandParams { ml_ref: 1.0, age_ref_gyr: 1.0, alpha: 0.0 });

        RunParams {
            eps: self.clustering.eps,
            min_samples: self.clustering.min_samples,
            child_depth: self.children.depth,
            band: self.luminosity.band.clone(),
            band_params,
            cylindrical: self.luminosity.cylindrical,
            min_age_gyr: self.luminosity.min_age_gyr,
            cosmology: self.cosmology,
            overdensity: 200.0,
            kravtsov_fraction: 0.02,
            snapshot_format: self.output.snapshot_format,
        }
    }
}
