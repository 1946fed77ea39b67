use darktrace_common::{Halo, HaloCatalogue, SimulationState};
use log::{debug, warn};
use std::collections::HashSet;

/// Particle ids belonging to the sub-halos of a host halo.
/// Lists may contain duplicates; use [`ChildParticles::excluded_set`] for membership tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildParticles {
    pub dm_ids: Vec<u64>,
    pub star_ids: Vec<u64>,
    pub subhalo_ids: Vec<u64>,
}

impl ChildParticles {
    pub fn is_empty(&self) -> bool {
        self.dm_ids.is_empty() && self.star_ids.is_empty()
    }

    /// Every excluded particle id (dark matter and stars) as a set.
    pub fn excluded_set(&self) -> HashSet<u64> {
        self.dm_ids.iter().chain(self.star_ids.iter()).copied().collect()
    }
}

/// Collects the particles of the halo's sub-halos down to `depth` levels.
///
/// A halo without a `children` property has no known substructure and yields
/// an empty result. Child ids missing from the catalogue, or children without
/// membership arrays, contribute nothing. Star ids are collected only for
/// fiducial (baryonic) runs. `depth == 1` visits direct children only.
pub fn resolve_children(
    halo: &Halo,
    catalogue: &HaloCatalogue,
    state: SimulationState,
    depth: u32,
) -> ChildParticles {
    let mut out = ChildParticles::default();
    let mut visited = HashSet::from([halo.id]);
    collect(halo, catalogue, state, depth, &mut visited, &mut out);
    debug!(
        "halo {}: {} sub-halos, {} dm / {} star particles excluded",
        halo.id,
        out.subhalo_ids.len(),
        out.dm_ids.len(),
        out.star_ids.len()
    );
    out
}

fn collect(
    halo: &Halo,
    catalogue: &HaloCatalogue,
    state: SimulationState,
    depth: u32,
    visited: &mut HashSet<u64>,
    out: &mut ChildParticles,
) {
    if depth == 0 {
        return;
    }
    let Some(children) = halo.children() else {
        return;
    };
    // Each halo is walked once, so self-references and cycles end here.
    let fresh: Vec<u64> = children
        .into_iter()
        .filter(|&id| {
            let first = visited.insert(id);
            if !first {
                warn!("halo {} lists already visited halo {} as a child; ignoring", halo.id, id);
            }
            first
        })
        .collect();
    out.subhalo_ids.extend_from_slice(&fresh);

    for child_id in fresh {
        let Some(child) = catalogue.get(child_id) else {
            warn!("child halo {} of halo {} not found in catalogue", child_id, halo.id);
            continue;
        };
        out.dm_ids.extend_from_slice(child.dm_iords());
        if state == SimulationState::Fiducial {
            out.star_ids.extend_from_slice(child.star_iords());
        }
        collect(child, catalogue, state, depth - 1, visited, out);
    }
}
