use serde::{Deserialize, Serialize};

use crate::config::{BandParams, CosmologyConfig, SnapshotFormat};

/// Run parameters derived from the configuration, fixed for the whole snapshot loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    // Clustering
    pub eps: f64,         // DBSCAN neighbourhood radius (kpc)
    pub min_samples: f64, // Neighbourhood mass needed for a core point

    // Substructure
    pub child_depth: u32,

    // Luminosity
    pub band: String,
    pub band_params: BandParams,
    pub cylindrical: bool,
    pub min_age_gyr: f64,

    // Halo geometry
    pub cosmology: CosmologyConfig,
    pub overdensity: f64,       // Relative to the critical density
    pub kravtsov_fraction: f64, // r_ref = fraction * r200c

    pub snapshot_format: SnapshotFormat,
}
