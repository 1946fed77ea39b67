use crate::geometry::{center_of_mass, GeometryError};
use darktrace_common::{ParticleSet, Vec3};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RadiusError {
    #[error("no particles selected")]
    Empty,
    #[error("{particles} particles but {weights} weights")]
    LengthMismatch { particles: usize, weights: usize },
    /// Total stellar mass (or luminosity) is zero or not finite.
    #[error("total {quantity} is zero")]
    ZeroTotal { quantity: &'static str },
}

impl From<GeometryError> for RadiusError {
    fn from(e: GeometryError) -> Self {
        match e {
            GeometryError::ZeroMass => RadiusError::ZeroTotal { quantity: "particle mass" },
            _ => RadiusError::Empty,
        }
    }
}

/// Moves the selection onto its own centre of mass and returns that centre
/// (in the frame the particles were in before the shift).
pub fn recenter_on_mass(particles: &mut ParticleSet) -> Result<Vec3, RadiusError> {
    let com = center_of_mass(particles)?;
    particles.recenter(com);
    Ok(com)
}

/// Radius of the first particle, in ascending distance order, at which the
/// cumulative weight reaches half the total. No interpolation between particles.
pub fn half_weight_radius(distances: &[f64], weights: &[f64], quantity: &'static str) -> Result<f64, RadiusError> {
    if distances.len() != weights.len() {
        return Err(RadiusError::LengthMismatch { particles: distances.len(), weights: weights.len() });
    }
    if distances.is_empty() {
        return Err(RadiusError::Empty);
    }

    let mut order: Vec<usize> = (0..distances.len()).collect();
    // Stable sort: equal distances keep their input order.
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));

    let cumulative: Vec<f64> = order
        .iter()
        .scan(0.0, |acc, &i| {
            *acc += weights[i];
            Some(*acc)
        })
        .collect();
    let total = cumulative[cumulative.len() - 1];
    if !(total > 0.0) || !total.is_finite() {
        return Err(RadiusError::ZeroTotal { quantity });
    }

    let half = total / 2.0;
    let k = cumulative
        .iter()
        .position(|&c| c >= half)
        .unwrap_or(cumulative.len() - 1);
    Ok(distances[order[k]])
}

/// Half-mass radius from in-plane (x, y) distances to the origin, weighted by
/// each particle's cumulative stellar mass. z is not used.
pub fn half_mass_radius(particles: &ParticleSet, mstar: &[f64]) -> Result<f64, RadiusError> {
    let distances: Vec<f64> = particles.positions().map(|p| p.length_xy()).collect();
    half_weight_radius(&distances, mstar, "stellar mass")
}

/// Computes a half-light radius from per-particle luminosities.
pub trait HalfLightEstimator {
    fn half_light_radius(
        &self,
        particles: &ParticleSet,
        luminosities: &[f64],
        band: &str,
        cylindrical: bool,
    ) -> Result<f64, RadiusError>;
}

/// Luminosity-weighted counterpart of [`half_mass_radius`]: 3D distances, or
/// projected x-y distances when `cylindrical` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LuminosityWeightedHalfLight;

impl HalfLightEstimator for LuminosityWeightedHalfLight {
    fn half_light_radius(
        &self,
        particles: &ParticleSet,
        luminosities: &[f64],
        _band: &str,
        cylindrical: bool,
    ) -> Result<f64, RadiusError> {
        let distances: Vec<f64> = if cylindrical {
            particles.positions().map(|p| p.length_xy()).collect()
        } else {
            particles.positions().map(|p| p.length()).collect()
        };
        half_weight_radius(&distances, luminosities, "luminosity")
    }
}

/// Reference radius tied to the host halo's r200c.
pub fn kravtsov_radius(r200c: f64, fraction: f64) -> f64 {
    r200c * fraction
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveRadii {
    pub half_mass: f64,
    pub half_light: f64,
}

/// Half-mass and half-light radii of an already re-centred selection.
pub fn compute_radii<H: HalfLightEstimator + ?Sized>(
    particles: &ParticleSet,
    mstar: &[f64],
    luminosities: &[f64],
    estimator: &H,
    band: &str,
    cylindrical: bool,
) -> Result<EffectiveRadii, RadiusError> {
    let half_mass = half_mass_radius(particles, mstar)?;
    let half_light = estimator.half_light_radius(particles, luminosities, band, cylindrical)?;
    Ok(EffectiveRadii { half_mass, half_light })
}
