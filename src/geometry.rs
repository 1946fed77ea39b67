use darktrace_common::{weighted_mean, CosmologyConfig, ParticleSet, Vec3};
use log::{debug, trace};
use thiserror::Error;

/// Gravitational constant in kpc (km/s)^2 / Msun.
const G_KPC_KMS2_MSUN: f64 = 4.300_917_27e-6;
/// Shrink factor applied to the sphere radius at each shrinking-sphere iteration.
const SHRINK_FACTOR: f64 = 0.7;
/// The shrinking sphere stops once it holds this many particles (or 1% of the halo).
const SHRINK_MIN_PARTICLES: usize = 100;
const MAX_SHRINK_ITERATIONS: usize = 200;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("no particles to center on")]
    NoParticles,
    #[error("particles have zero total mass")]
    ZeroMass,
    #[error("enclosed density never reaches {overdensity} x critical")]
    VirialRadiusNotFound { overdensity: f64 },
}

/// Mass-weighted mean position.
pub fn center_of_mass(particles: &ParticleSet) -> Result<Vec3, GeometryError> {
    if particles.is_empty() {
        return Err(GeometryError::NoParticles);
    }
    weighted_mean(particles.positions().zip(particles.mass.iter().copied())).ok_or(GeometryError::ZeroMass)
}

/// Shrinking-sphere centre of a particle distribution.
///
/// Starts from the centre of mass with a sphere enclosing every particle, then
/// repeatedly shrinks the radius by [`SHRINK_FACTOR`] and recomputes the centre of
/// mass of the enclosed particles until too few remain.
pub fn shrink_sphere_center(particles: &ParticleSet) -> Result<Vec3, GeometryError> {
    let mut center = center_of_mass(particles)?;
    let n = particles.len();
    let stop_at = SHRINK_MIN_PARTICLES.max(n / 100).max(1);

    let mut radius = particles
        .positions()
        .map(|p| p.distance(center))
        .fold(0.0_f64, f64::max);

    let mut iterations = 0;
    while radius > 0.0 && iterations < MAX_SHRINK_ITERATIONS {
        let r_sq = radius * radius;
        let inside = particles
            .positions()
            .zip(particles.mass.iter().copied())
            .filter(|(p, _)| p.distance_squared(center) <= r_sq);
        let (count, next) = {
            let pts: Vec<(Vec3, f64)> = inside.collect();
            (pts.len(), weighted_mean(pts))
        };
        if count < stop_at {
            break;
        }
        match next {
            Some(c) => center = c,
            None => break,
        }
        radius *= SHRINK_FACTOR;
        iterations += 1;
        trace!("shrink-sphere iteration {}: r={:.4}, n={}", iterations, radius, count);
    }
    debug!("shrink-sphere center {:?} after {} iterations", center, iterations);
    Ok(center)
}

/// Hubble rate at redshift `z` in km/s/kpc.
pub fn hubble_rate(z: f64, cosmology: &CosmologyConfig) -> f64 {
    let a_inv = 1.0 + z;
    let omega_k = 1.0 - cosmology.omega_m - cosmology.omega_lambda;
    let e_sq = cosmology.omega_m * a_inv.powi(3) + omega_k * a_inv.powi(2) + cosmology.omega_lambda;
    // H0 = 100 h km/s/Mpc = 0.1 h km/s/kpc
    0.1 * cosmology.h * e_sq.max(0.0).sqrt()
}

/// Critical density at redshift `z` in Msun / kpc^3.
pub fn critical_density(z: f64, cosmology: &CosmologyConfig) -> f64 {
    let h = hubble_rate(z, cosmology);
    3.0 * h * h / (8.0 * std::f64::consts::PI * G_KPC_KMS2_MSUN)
}

/// Largest radius around the (already centered) origin inside which the mean
/// enclosed density is at least `overdensity * rho_crit`.
pub fn virial_radius(particles: &ParticleSet, overdensity: f64, rho_crit: f64) -> Result<f64, GeometryError> {
    if particles.is_empty() {
        return Err(GeometryError::NoParticles);
    }
    let mut shells: Vec<(f64, f64)> = particles
        .positions()
        .zip(particles.mass.iter().copied())
        .map(|(p, m)| (p.length(), m))
        .collect();
    shells.sort_by(|a, b| a.0.total_cmp(&b.0));

    let threshold = overdensity * rho_crit;
    let mut enclosed = 0.0;
    let mut found = None;
    for (r, m) in shells {
        enclosed += m;
        if r <= 0.0 {
            continue;
        }
        let volume = 4.0 / 3.0 * std::f64::consts::PI * r.powi(3);
        if enclosed / volume >= threshold {
            found = Some(r);
        }
    }
    found.ok_or(GeometryError::VirialRadiusNotFound { overdensity })
}

/// Mask of particles within `radius` (3D) of the origin.
pub fn within_radius(particles: &ParticleSet, radius: f64) -> Vec<bool> {
    particles.positions().map(|p| p.length() <= radius).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(points: &[(f64, f64, f64, f64)]) -> ParticleSet {
        ParticleSet {
            iord: (0..points.len() as u64).collect(),
            x: points.iter().map(|p| p.0).collect(),
            y: points.iter().map(|p| p.1).collect(),
            z: points.iter().map(|p| p.2).collect(),
            mass: points.iter().map(|p| p.3).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn center_of_mass_weights_positions() {
        let s = set(&[(0.0, 0.0, 0.0, 1.0), (2.0, 2.0, 2.0, 1.0)]);
        assert_eq!(center_of_mass(&s).unwrap(), Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(center_of_mass(&ParticleSet::default()), Err(GeometryError::NoParticles));
        assert_eq!(center_of_mass(&set(&[(1.0, 0.0, 0.0, 0.0)])), Err(GeometryError::ZeroMass));
    }

    #[test]
    fn shrink_sphere_finds_dense_clump_over_outlier() {
        // A tight clump at (10,10,10) and one heavy distant particle pulling the centre of mass away.
        let mut pts = Vec::new();
        for i in 0..400 {
            let d = (i % 20) as f64 * 0.01;
            pts.push((10.0 + d, 10.0 - d, 10.0 + d * 0.5, 1.0));
        }
        pts.push((200.0, 0.0, 0.0, 200.0));
        let c = shrink_sphere_center(&set(&pts)).unwrap();
        assert!(c.distance(Vec3::new(10.1, 9.9, 10.05)) < 0.5, "center was {:?}", c);
    }

    #[test]
    fn critical_density_today_matches_known_value() {
        // rho_crit,0 = 277.5 h^2 Msun / kpc^3
        let cosmo = CosmologyConfig { h: 1.0, omega_m: 0.3, omega_lambda: 0.7 };
        let rho = critical_density(0.0, &cosmo);
        assert!((rho - 277.5).abs() / 277.5 < 1e-3, "rho_crit = {}", rho);
        assert!(critical_density(1.0, &cosmo) > rho);
    }

    #[test]
    fn virial_radius_of_uniform_shells() {
        // 1000 unit masses on the unit sphere: mean density inside r=1 is 1000 / (4/3 pi).
        let pts: Vec<_> = (0..1000)
            .map(|i| {
                let theta = i as f64 * 0.1;
                (theta.cos(), theta.sin(), 0.0, 1.0)
            })
            .collect();
        let s = set(&pts);
        let rho_inside = 1000.0 / (4.0 / 3.0 * std::f64::consts::PI);
        let r = virial_radius(&s, 200.0, rho_inside / 400.0).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
        assert!(matches!(
            virial_radius(&s, 200.0, rho_inside),
            Err(GeometryError::VirialRadiusNotFound { .. })
        ));
    }

    #[test]
    fn within_radius_uses_3d_distance() {
        let s = set(&[(0.0, 0.0, 3.0, 1.0), (1.0, 0.0, 0.0, 1.0)]);
        assert_eq!(within_radius(&s, 2.0), vec![false, true]);
    }
}
