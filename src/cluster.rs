use crate::grid::NeighbourGrid;
use log::{debug, info};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Label given to points that belong to no cluster.
pub const NOISE: i32 = -1;

/// Iords of the central cluster selected at the previous processed snapshot.
/// Replaced wholesale after every successful snapshot, never merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContinuityState {
    iords: HashSet<u64>,
}

impl ContinuityState {
    pub fn empty() -> Self {
        ContinuityState::default()
    }

    pub fn from_iords<I: IntoIterator<Item = u64>>(iords: I) -> Self {
        ContinuityState { iords: iords.into_iter().collect() }
    }

    pub fn contains(&self, iord: u64) -> bool {
        self.iords.contains(&iord)
    }

    pub fn len(&self) -> usize {
        self.iords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iords.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    /// Two or fewer candidates; nothing meaningful to cluster.
    #[error("only {count} candidate particles, need at least 3 to cluster")]
    TooFewParticles { count: usize },
    /// Every candidate was labelled noise.
    #[error("all {candidates} candidate particles were classified as noise")]
    NoCluster { candidates: usize },
    #[error("clustering inputs differ in length: {points} points, {weights} weights, {iords} iords")]
    LengthMismatch { points: usize, weights: usize, iords: usize },
}

/// How the central label was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Most common label among particles carried over from the previous snapshot.
    Continuity,
    /// Most populous cluster overall.
    Largest,
}

/// The cluster identified as the genuine central stellar structure.
#[derive(Debug, Clone, PartialEq)]
pub struct CentralCluster {
    pub label: i32,
    /// Per-candidate membership in the selected cluster.
    pub mask: Vec<bool>,
    /// Iords of the members, in candidate order.
    pub iords: Vec<u64>,
    pub strategy: SelectionStrategy,
}

impl CentralCluster {
    pub fn len(&self) -> usize {
        self.iords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iords.is_empty()
    }

    /// Continuity state to hand to the next snapshot.
    pub fn continuity(&self) -> ContinuityState {
        ContinuityState::from_iords(self.iords.iter().copied())
    }
}

/// Mass-weighted DBSCAN in the plane.
///
/// A point is a core point when the summed weight of all points within `eps`
/// (itself included) is at least `min_samples`. Clusters are numbered from 0 in
/// the order their first core point appears in the input; border points join the
/// first cluster that reaches them. Unreached points are [`NOISE`].
pub fn dbscan(points: &[(f64, f64)], weights: &[f64], eps: f64, min_samples: f64) -> Vec<i32> {
    let n = points.len();
    let grid = NeighbourGrid::build(points, eps);

    // Neighbourhood queries are independent; run them in parallel.
    let neighbourhoods: Vec<Vec<usize>> = points
        .par_iter()
        .map(|&p| grid.neighbors(points, p, eps))
        .collect();
    let is_core: Vec<bool> = neighbourhoods
        .par_iter()
        .map(|nb| nb.iter().map(|&j| weights[j]).sum::<f64>() >= min_samples)
        .collect();

    let mut labels = vec![NOISE; n];
    let mut next_label = 0;
    let mut stack = Vec::new();
    for i in 0..n {
        if labels[i] != NOISE || !is_core[i] {
            continue;
        }
        labels[i] = next_label;
        stack.push(i);
        while let Some(p) = stack.pop() {
            if !is_core[p] {
                continue;
            }
            for &q in &neighbourhoods[p] {
                if labels[q] == NOISE {
                    labels[q] = next_label;
                    stack.push(q);
                }
            }
        }
        next_label += 1;
    }
    debug!("dbscan: {} points, {} clusters, {} noise", n, next_label, labels.iter().filter(|&&l| l == NOISE).count());
    labels
}

/// Most frequent non-noise label; ties go to the lowest label.
pub fn most_frequent_label<I: IntoIterator<Item = i32>>(labels: I) -> Option<i32> {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for l in labels.into_iter().filter(|&l| l != NOISE) {
        *counts.entry(l).or_insert(0) += 1;
    }
    let mut best: Option<(i32, usize)> = None;
    for (label, count) in counts {
        // Strictly greater keeps the earlier (lower) label on ties.
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label)
}

/// Clusters the candidates and picks the central structure.
///
/// Candidates that were in the previous snapshot's central cluster vote first;
/// if none of them landed in a cluster, the largest cluster wins.
pub fn select_central_cluster(
    points: &[(f64, f64)],
    weights: &[f64],
    iords: &[u64],
    previous: &ContinuityState,
    eps: f64,
    min_samples: f64,
) -> Result<CentralCluster, ClusterError> {
    if points.len() != weights.len() || points.len() != iords.len() {
        return Err(ClusterError::LengthMismatch {
            points: points.len(),
            weights: weights.len(),
            iords: iords.len(),
        });
    }
    if points.len() <= 2 {
        return Err(ClusterError::TooFewParticles { count: points.len() });
    }

    let labels = dbscan(points, weights, eps, min_samples);

    let carried: Vec<i32> = iords
        .iter()
        .zip(labels.iter())
        .filter(|(iord, _)| previous.contains(**iord))
        .map(|(_, &l)| l)
        .collect();

    let (label, strategy) = match most_frequent_label(carried.iter().copied()) {
        Some(label) => (label, SelectionStrategy::Continuity),
        None => {
            if previous.is_empty() {
                info!("largest cluster used, no previous particles");
            } else if carried.is_empty() {
                info!("largest cluster used, none of {} previous particles are candidates", previous.len());
            } else {
                info!("largest cluster used, {} previous particles were all noise", carried.len());
            }
            let label = most_frequent_label(labels.iter().copied())
                .ok_or(ClusterError::NoCluster { candidates: points.len() })?;
            (label, SelectionStrategy::Largest)
        }
    };

    let mask: Vec<bool> = labels.iter().map(|&l| l == label).collect();
    let selected: Vec<u64> = iords
        .iter()
        .zip(mask.iter())
        .filter_map(|(&iord, &keep)| keep.then_some(iord))
        .collect();
    debug!("central cluster {} ({:?}) with {} members", label, strategy, selected.len());

    Ok(CentralCluster { label, mask, iords: selected, strategy })
}
