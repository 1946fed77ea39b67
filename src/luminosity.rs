use crate::tagged::TaggedParticles;
use anyhow::Result;
use darktrace_common::{BandParams, LuminosityConfig};
use std::collections::{BTreeMap, HashMap};

/// Assigns a luminosity to each selected particle from its tagging history.
pub trait LuminosityModel {
    /// Luminosity in `band` at time `t_now` for each iord in `iords`, in the same order.
    fn luminosities(&self, tagged: &TaggedParticles, iords: &[u64], t_now: f64, band: &str) -> Result<Vec<f64>>;
}

/// Each tagged record is a single-age population of mass `mstar` formed at `t`
/// whose light fades as a power law of its age.
#[derive(Debug, Clone)]
pub struct FadingPowerLaw {
    bands: BTreeMap<String, BandParams>,
    min_age_gyr: f64,
}

impl FadingPowerLaw {
    pub fn new(bands: BTreeMap<String, BandParams>, min_age_gyr: f64) -> Self {
        FadingPowerLaw { bands, min_age_gyr }
    }

    pub fn from_config(config: &LuminosityConfig) -> Self {
        Self::new(config.bands.clone(), config.min_age_gyr)
    }

    /// A model that knows a single band.
    pub fn single_band(band: &str, params: BandParams, min_age_gyr: f64) -> Self {
        let mut bands = BTreeMap::new();
        bands.insert(band.to_string(), params);
        Self::new(bands, min_age_gyr)
    }

    /// Light-to-mass ratio of a population of the given age (Gyr).
    pub fn light_to_mass(&self, params: &BandParams, age_gyr: f64) -> f64 {
        let age = age_gyr.max(self.min_age_gyr);
        (age / params.age_ref_gyr).powf(-params.alpha) / params.ml_ref
    }
}

impl LuminosityModel for FadingPowerLaw {
    fn luminosities(&self, tagged: &TaggedParticles, iords: &[u64], t_now: f64, band: &str) -> Result<Vec<f64>> {
        let params = self
            .bands
            .get(band)
            .ok_or_else(|| anyhow::anyhow!("no fading parameters for band '{}'", band))?;

        let mut per_particle: HashMap<u64, f64> = HashMap::new();
        for r in tagged.records_up_to(t_now) {
            *per_particle.entry(r.iords).or_insert(0.0) += r.mstar * self.light_to_mass(params, t_now - r.t);
        }
        Ok(iords.iter().map(|i| per_particle.get(i).copied().unwrap_or(0.0)).collect())
    }
}
