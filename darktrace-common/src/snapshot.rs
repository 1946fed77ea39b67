use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::vecmath::Vec3;

/// Whether a simulation carries baryons. DMO runs have no star particles to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationState {
    Dmo,
    Fiducial,
}

impl SimulationState {
    /// Parses the state from a simulation name such as `Halo1459_DMO`.
    /// The second `_`-separated token decides; anything but `DMO` is fiducial.
    pub fn from_sim_name(sim_name: &str) -> Self {
        match sim_name.split('_').nth(1) {
            Some(tag) if tag.eq_ignore_ascii_case("dmo") => SimulationState::Dmo,
            _ => SimulationState::Fiducial,
        }
    }
}

/// Name of the DMO run a simulation's halo database and particle files live under.
///
/// Reionization variants end in a three-character `x..` tag (`Halo1459_fiducial_x05`)
/// and map to `Halo1459_DMO_Mreionx05`; every other name is used as-is.
pub fn dmo_simulation_name(sim_name: &str) -> String {
    let chars: Vec<char> = sim_name.chars().collect();
    if chars.len() >= 3 && chars[chars.len() - 3] == 'x' {
        let prefix = sim_name.split('_').next().unwrap_or(sim_name);
        let halonum = prefix.strip_prefix("Halo").unwrap_or(prefix);
        let tag: String = chars[chars.len() - 3..].iter().collect();
        format!("Halo{}_DMO_Mreion{}", halonum, tag)
    } else {
        sim_name.to_string()
    }
}

/// Particle arrays for one family (dark matter or stars), structure-of-arrays layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleSet {
    pub iord: Vec<u64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    #[serde(default)]
    pub vx: Vec<f64>,
    #[serde(default)]
    pub vy: Vec<f64>,
    #[serde(default)]
    pub vz: Vec<f64>,
    pub mass: Vec<f64>,
}

impl ParticleSet {
    pub fn len(&self) -> usize {
        self.iord.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iord.is_empty()
    }

    /// Checks that every per-particle array has the same length as `iord`.
    /// Velocities are all present or all absent.
    pub fn validate(&self) -> anyhow::Result<()> {
        let n = self.len();
        let lens = [self.x.len(), self.y.len(), self.z.len(), self.mass.len()];
        if lens.iter().any(|&l| l != n) {
            anyhow::bail!(
                "particle arrays have inconsistent lengths: iord={}, x={}, y={}, z={}, mass={}",
                n, lens[0], lens[1], lens[2], lens[3]
            );
        }
        let vel = [self.vx.len(), self.vy.len(), self.vz.len()];
        let absent = vel.iter().all(|&l| l == 0);
        let present = vel.iter().all(|&l| l == n);
        if !absent && !present {
            anyhow::bail!("velocity arrays have inconsistent lengths: {:?} for {} particles", vel, n);
        }
        Ok(())
    }

    pub fn position(&self, i: usize) -> Vec3 {
        Vec3::new(self.x[i], self.y[i], self.z[i])
    }

    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        (0..self.len()).map(move |i| self.position(i))
    }

    fn has_velocities(&self) -> bool {
        !self.vx.is_empty()
    }

    /// Returns the subset of particles at the given indices, in that order.
    pub fn select_indices(&self, indices: &[usize]) -> ParticleSet {
        let pick = |v: &Vec<f64>| indices.iter().map(|&i| v[i]).collect::<Vec<f64>>();
        let vel = self.has_velocities();
        ParticleSet {
            iord: indices.iter().map(|&i| self.iord[i]).collect(),
            x: pick(&self.x),
            y: pick(&self.y),
            z: pick(&self.z),
            vx: if vel { pick(&self.vx) } else { Vec::new() },
            vy: if vel { pick(&self.vy) } else { Vec::new() },
            vz: if vel { pick(&self.vz) } else { Vec::new() },
            mass: pick(&self.mass),
        }
    }

    /// Returns the subset of particles where `mask` is true.
    pub fn select(&self, mask: &[bool]) -> ParticleSet {
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        self.select_indices(&indices)
    }

    /// Shifts every position by `-origin`, re-centering the set on `origin`.
    pub fn recenter(&mut self, origin: Vec3) {
        self.x.iter_mut().for_each(|v| *v -= origin.x);
        self.y.iter_mut().for_each(|v| *v -= origin.y);
        self.z.iter_mut().for_each(|v| *v -= origin.z);
    }

    pub fn total_mass(&self) -> f64 {
        self.mass.iter().sum()
    }
}

/// Halo-finder properties attached to a halo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaloProperties {
    /// Ids of sub-halos. `None` when the finder reported no `children` entry at all.
    #[serde(default)]
    pub children: Option<Vec<u64>>,
    /// Any other scalar properties (e.g. `r200c`, `Mvir`).
    #[serde(default)]
    pub scalars: BTreeMap<String, f64>,
}

/// A halo from a halo-finder catalogue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Halo {
    pub id: u64,
    #[serde(default)]
    pub properties: HaloProperties,
    #[serde(default)]
    pub dm_iords: Option<Vec<u64>>,
    #[serde(default)]
    pub star_iords: Option<Vec<u64>>,
}

impl Halo {
    /// Ids listed under the `children` property, or `None` when the key is absent.
    pub fn children(&self) -> Option<Vec<u64>> {
        self.properties.children.clone()
    }

    pub fn property(&self, key: &str) -> Option<f64> {
        self.properties.scalars.get(key).copied()
    }

    pub fn dm_iords(&self) -> &[u64] {
        self.dm_iords.as_deref().unwrap_or(&[])
    }

    pub fn star_iords(&self) -> &[u64] {
        self.star_iords.as_deref().unwrap_or(&[])
    }
}

/// The halos found in one snapshot, in catalogue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaloCatalogue {
    pub halos: Vec<Halo>,
}

impl HaloCatalogue {
    pub fn new(halos: Vec<Halo>) -> Self {
        HaloCatalogue { halos }
    }

    /// Looks a halo up by its catalogue id.
    pub fn get(&self, id: u64) -> Option<&Halo> {
        self.halos.iter().find(|h| h.id == id)
    }

    /// Looks a halo up by 1-based position in the catalogue.
    pub fn nth_1based(&self, position: u64) -> Option<&Halo> {
        let idx = usize::try_from(position).ok()?.checked_sub(1)?;
        self.halos.get(idx)
    }

    pub fn len(&self) -> usize {
        self.halos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halos.is_empty()
    }
}

/// Particle and halo data for a single simulation output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub output: String,
    pub dm: ParticleSet,
    #[serde(default)]
    pub stars: Option<ParticleSet>,
    #[serde(default)]
    pub halos: HaloCatalogue,
}

/// One row of the externally produced particle-tagging table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaggedRecord {
    pub iords: u64,
    pub t: f64,
    pub mstar: f64,
}

/// One row of the effective-radius table, one per successfully processed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub halflight: f64,
    pub reff: f64,
    pub z: f64,
    pub t: f64,
    pub kravtsov: f64,
}
