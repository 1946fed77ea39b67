use crate::children::resolve_children;
use crate::cluster::{select_central_cluster, CentralCluster, ClusterError, ContinuityState, SelectionStrategy};
use crate::geometry::{critical_density, shrink_sphere_center, virial_radius, within_radius};
use crate::halonums::CatalogueConvention;
use crate::index::IndexingProvider;
use crate::luminosity::{FadingPowerLaw, LuminosityModel};
use crate::output::ReffTable;
use crate::radius::{compute_radii, kravtsov_radius, recenter_on_mass, HalfLightEstimator, LuminosityWeightedHalfLight};
use crate::source::SnapshotSource;
use crate::tagged::TaggedParticles;
use anyhow::Result;
use darktrace_common::{ParticleSet, ResultRow, RunParams, SimulationState};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// One entry of the chronological snapshot sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotStep {
    pub index: usize,
    pub output: String,
    pub halonum: u64,
    pub t: f64,
    pub z: f64,
}

/// Why a snapshot contributed no row. None of these stop the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("no tagged particles yet")]
    NoTaggedParticles,
    #[error("tagged stellar mass is zero")]
    ZeroTaggedMass,
    #[error("particle data exists but failed to read it: {0}")]
    LoadFailed(String),
    #[error("main halo not found: {0}")]
    HaloNotFound(String),
    #[error("centering data unavailable: {0}")]
    CenteringFailed(String),
    #[error("could not calculate R200c: {0}")]
    VirialRadiusFailed(String),
    #[error("no in-situ tagged particles inside R200c")]
    EmptyCandidates,
    #[error("only {count} in-situ candidates, need at least 3")]
    TooFewParticles { count: usize },
    #[error("no central cluster: {0}")]
    NoCluster(String),
    #[error("inconsistent clustering input: {0}")]
    ClusterInput(String),
    #[error("central cluster is empty")]
    EmptySelection,
    #[error("radius estimate failed: {0}")]
    RadiusFailed(String),
}

impl SkipReason {
    /// Short stable name, used for tallies.
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::NoTaggedParticles => "no_tagged_particles",
            SkipReason::ZeroTaggedMass => "zero_tagged_mass",
            SkipReason::LoadFailed(_) => "load_failed",
            SkipReason::HaloNotFound(_) => "halo_not_found",
            SkipReason::CenteringFailed(_) => "centering_failed",
            SkipReason::VirialRadiusFailed(_) => "virial_radius_failed",
            SkipReason::EmptyCandidates => "empty_candidates",
            SkipReason::TooFewParticles { .. } => "too_few_particles",
            SkipReason::NoCluster(_) => "no_cluster",
            SkipReason::ClusterInput(_) => "cluster_input",
            SkipReason::EmptySelection => "empty_selection",
            SkipReason::RadiusFailed(_) => "radius_failed",
        }
    }
}

impl From<ClusterError> for SkipReason {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::TooFewParticles { count } => SkipReason::TooFewParticles { count },
            e @ ClusterError::NoCluster { .. } => SkipReason::NoCluster(e.to_string()),
            e @ ClusterError::LengthMismatch { .. } => SkipReason::ClusterInput(e.to_string()),
        }
    }
}

/// A successfully processed snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedSnapshot {
    pub row: ResultRow,
    pub candidates: usize,
    pub central_iords: Vec<u64>,
    pub strategy: SelectionStrategy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    Emitted(EmittedSnapshot),
    Skipped(SkipReason),
}

/// Per-run tallies of emitted and skipped snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub emitted: usize,
    pub skipped: BTreeMap<&'static str, usize>,
    /// Outcome per output, in processing order.
    pub outcomes: Vec<(String, SnapshotOutcome)>,
}

impl RunSummary {
    fn record(&mut self, step: &SnapshotStep, outcome: &SnapshotOutcome) {
        match outcome {
            SnapshotOutcome::Emitted(_) => self.emitted += 1,
            SnapshotOutcome::Skipped(reason) => *self.skipped.entry(reason.kind()).or_insert(0) += 1,
        }
        self.outcomes.push((step.output.clone(), outcome.clone()));
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Completed { table: ReffTable, summary: RunSummary },
    /// Output list and progenitor redshift/time arrays disagree; nothing was processed.
    IndexMismatch { outputs: usize, redshifts: usize, times: usize },
}

/// Candidates that made it through clustering.
struct Selection {
    particles: ParticleSet,
    mstar: Vec<f64>,
    cluster: CentralCluster,
    candidates: usize,
    r200c: f64,
}

/// Tagged dark-matter particles inside the host that are not claimed by a sub-halo.
pub fn in_situ_candidates(
    inner: &ParticleSet,
    excluded: &HashSet<u64>,
    tagged_mass: &BTreeMap<u64, f64>,
) -> ParticleSet {
    let mask: Vec<bool> = inner
        .iord
        .iter()
        .map(|iord| !excluded.contains(iord) && tagged_mass.contains_key(iord))
        .collect();
    inner.select(&mask)
}

/// Measures effective radii of the tagged stellar population along the main branch.
pub struct ReffPipeline<I: IndexingProvider, S: SnapshotSource> {
    params: RunParams,
    state: SimulationState,
    index: I,
    source: S,
    convention: CatalogueConvention,
    luminosity: Box<dyn LuminosityModel>,
    half_light: Box<dyn HalfLightEstimator>,
}

impl<I: IndexingProvider, S: SnapshotSource> ReffPipeline<I, S> {
    pub fn new(params: RunParams, state: SimulationState, index: I, source: S, convention: CatalogueConvention) -> Self {
        let luminosity = FadingPowerLaw::single_band(&params.band, params.band_params, params.min_age_gyr);
        ReffPipeline {
            params,
            state,
            index,
            source,
            convention,
            luminosity: Box::new(luminosity),
            half_light: Box::new(LuminosityWeightedHalfLight),
        }
    }

    pub fn with_luminosity_model(mut self, model: Box<dyn LuminosityModel>) -> Self {
        self.luminosity = model;
        self
    }

    pub fn with_half_light_estimator(mut self, estimator: Box<dyn HalfLightEstimator>) -> Self {
        self.half_light = estimator;
        self
    }

    /// Chronological snapshot sequence, or the mismatch sentinel when the
    /// progenitor arrays do not line up with the output list.
    pub fn snapshot_steps(&self) -> Result<std::result::Result<Vec<SnapshotStep>, RunResult>> {
        let branch = self.index.main_branch()?;
        // Progenitor walks run latest-first.
        let mut times = self.index.progenitor_times()?;
        times.reverse();
        let mut redshifts = self.index.progenitor_redshifts()?;
        redshifts.reverse();

        let n = branch.outputs.len();
        info!("HALONUMS: {}, OUTPUTS: {}", branch.halonums.len(), n);
        if redshifts.len() != n || times.len() != n || branch.halonums.len() != n {
            error!(
                "output array length ({}) does not match redshift ({}) and time ({}) arrays",
                n,
                redshifts.len(),
                times.len()
            );
            return Ok(Err(RunResult::IndexMismatch { outputs: n, redshifts: redshifts.len(), times: times.len() }));
        }

        Ok(Ok(branch
            .outputs
            .into_iter()
            .zip(branch.halonums)
            .zip(times.into_iter().zip(redshifts))
            .enumerate()
            .map(|(index, ((output, halonum), (t, z)))| SnapshotStep { index, output, halonum, t, z })
            .collect()))
    }

    pub fn run(&self, tagged: &TaggedParticles) -> Result<RunResult> {
        self.run_with_progress(tagged, |_, _, _| {})
    }

    /// Processes every snapshot in time order, calling `on_step(done, total, outcome)` after each.
    pub fn run_with_progress<F>(&self, tagged: &TaggedParticles, mut on_step: F) -> Result<RunResult>
    where
        F: FnMut(usize, usize, &SnapshotOutcome),
    {
        let steps = match self.snapshot_steps()? {
            Ok(steps) => steps,
            Err(mismatch) => return Ok(mismatch),
        };
        let total = steps.len();
        info!(
            "Processing {} snapshots using the {} catalogue (eps={}, min_samples={}, child depth={})",
            total,
            self.convention.name(),
            self.params.eps,
            self.params.min_samples,
            self.params.child_depth
        );

        let mut table = ReffTable::new();
        let mut summary = RunSummary::default();

        // Continuity is a value threaded from one snapshot to the next.
        let final_state = steps.iter().fold(ContinuityState::empty(), |continuity, step| {
            let (outcome, next) = self.process_snapshot(step, tagged, continuity);
            match &outcome {
                SnapshotOutcome::Emitted(emitted) => table.push(emitted.row),
                SnapshotOutcome::Skipped(reason) => {
                    warn!("--> skipping {} (t={:.4}): {}", step.output, step.t, reason)
                }
            }
            summary.record(step, &outcome);
            on_step(step.index + 1, total, &outcome);
            next
        });
        debug!("final continuity state holds {} particles", final_state.len());

        info!("{} snapshots emitted, {} skipped {:?}", summary.emitted, summary.total_skipped(), summary.skipped);
        Ok(RunResult::Completed { table, summary })
    }

    /// Runs one snapshot through LOAD -> FILTER_RADIUS -> EXCLUDE_SUBSTRUCTURE
    /// -> CLUSTER -> RADIUS_ESTIMATE -> EMIT.
    ///
    /// Returns the outcome and the continuity state for the next snapshot. The
    /// state is replaced as soon as a central cluster is chosen, even if the
    /// radius estimate then fails; earlier skips hand the incoming state back.
    pub fn process_snapshot(
        &self,
        step: &SnapshotStep,
        tagged: &TaggedParticles,
        continuity: ContinuityState,
    ) -> (SnapshotOutcome, ContinuityState) {
        let tagged_mass = match self.tagged_mass_at(step, tagged) {
            Ok(m) => m,
            Err(reason) => return (SnapshotOutcome::Skipped(reason), continuity),
        };
        let selection = match self.select(step, &tagged_mass, &continuity) {
            Ok(s) => s,
            Err(reason) => return (SnapshotOutcome::Skipped(reason), continuity),
        };
        let next = selection.cluster.continuity();
        match self.estimate(step, tagged, selection) {
            Ok(emitted) => (SnapshotOutcome::Emitted(emitted), next),
            Err(reason) => (SnapshotOutcome::Skipped(reason), next),
        }
    }

    fn tagged_mass_at(&self, step: &SnapshotStep, tagged: &TaggedParticles) -> Result<BTreeMap<u64, f64>, SkipReason> {
        if !tagged.has_records_up_to(step.t) {
            return Err(SkipReason::NoTaggedParticles);
        }
        let grouped = tagged.cumulative_at(step.t);
        if grouped.is_empty() {
            return Err(SkipReason::NoTaggedParticles);
        }
        let total: f64 = grouped.values().sum();
        if total.is_nan() || total <= 0.0 {
            return Err(SkipReason::ZeroTaggedMass);
        }
        debug!("{}: half tagged mass {:.4e}", step.output, total / 2.0);
        Ok(grouped)
    }

    fn select(
        &self,
        step: &SnapshotStep,
        tagged_mass: &BTreeMap<u64, f64>,
        continuity: &ContinuityState,
    ) -> Result<Selection, SkipReason> {
        // LOAD
        let snapshot = self
            .source
            .load(&step.output)
            .map_err(|e| SkipReason::LoadFailed(format!("{:#}", e)))?;

        let halo = self
            .convention
            .locate_main_halo(&snapshot.halos, &step.output, step.halonum)
            .map_err(|e| SkipReason::HaloNotFound(format!("{:#}", e)))?;
        debug!("{}: main halo {} ({} catalogue)", step.output, halo.id, self.convention.name());

        let children = resolve_children(halo, &snapshot.halos, self.state, self.params.child_depth);
        let members: HashSet<u64> = halo.dm_iords().iter().copied().collect();
        if members.is_empty() {
            return Err(SkipReason::CenteringFailed(format!("halo {} has no dark matter members", halo.id)));
        }

        let mut dm = snapshot.dm;
        // Halo catalogue and star arrays are no longer needed.
        drop(snapshot.halos);
        drop(snapshot.stars);

        let host_mask: Vec<bool> = dm.iord.iter().map(|i| members.contains(i)).collect();
        let mut host = dm.select(&host_mask);
        let center = shrink_sphere_center(&host).map_err(|e| SkipReason::CenteringFailed(e.to_string()))?;
        dm.recenter(center);
        host.recenter(center);

        // FILTER_RADIUS
        let rho_crit = critical_density(step.z, &self.params.cosmology);
        let r200c = virial_radius(&host, self.params.overdensity, rho_crit)
            .map_err(|e| SkipReason::VirialRadiusFailed(e.to_string()))?;
        drop(host);
        let inner = dm.select(&within_radius(&dm, r200c));
        drop(dm);
        debug!("{}: r200c = {:.4} kpc, {} particles inside", step.output, r200c, inner.len());

        // EXCLUDE_SUBSTRUCTURE
        let excluded = children.excluded_set();
        let candidates = in_situ_candidates(&inner, &excluded, tagged_mass);
        drop(inner);
        if candidates.is_empty() {
            return Err(SkipReason::EmptyCandidates);
        }

        // CLUSTER
        let points: Vec<(f64, f64)> = candidates.x.iter().copied().zip(candidates.y.iter().copied()).collect();
        let cluster = select_central_cluster(
            &points,
            &candidates.mass,
            &candidates.iord,
            continuity,
            self.params.eps,
            self.params.min_samples,
        )?;
        let particles = candidates.select(&cluster.mask);
        let mstar = particles
            .iord
            .iter()
            .map(|i| tagged_mass.get(i).copied().unwrap_or(0.0))
            .collect();

        Ok(Selection { particles, mstar, cluster, candidates: candidates.len(), r200c })
    }

    fn estimate(&self, step: &SnapshotStep, tagged: &TaggedParticles, selection: Selection) -> Result<EmittedSnapshot, SkipReason> {
        let Selection { mut particles, mstar, cluster, candidates, r200c } = selection;
        if cluster.is_empty() {
            return Err(SkipReason::EmptySelection);
        }
        debug!("{}: {} of {} candidates in the central cluster", step.output, cluster.len(), candidates);

        // RADIUS_ESTIMATE
        recenter_on_mass(&mut particles).map_err(|e| SkipReason::RadiusFailed(e.to_string()))?;
        let luminosities = self
            .luminosity
            .luminosities(tagged, &particles.iord, step.t, &self.params.band)
            .map_err(|e| SkipReason::RadiusFailed(format!("{:#}", e)))?;
        let radii = compute_radii(
            &particles,
            &mstar,
            &luminosities,
            self.half_light.as_ref(),
            &self.params.band,
            self.params.cylindrical,
        )
        .map_err(|e| SkipReason::RadiusFailed(e.to_string()))?;

        let host_r200c = self.index.halo_r200c(&step.output, step.halonum).unwrap_or_else(|| {
            debug!("{}: no stored r200c, using measured {:.4}", step.output, r200c);
            r200c
        });
        let kravtsov = kravtsov_radius(host_r200c, self.params.kravtsov_fraction);

        // EMIT
        info!(
            "{} (t={:.3}, z={:.3}): halfmass radius {:.4}, halflight radius {:.4}, Kravtsov radius {:.4}",
            step.output, step.t, step.z, radii.half_mass, radii.half_light, kravtsov
        );
        Ok(EmittedSnapshot {
            row: ResultRow { halflight: radii.half_light, reff: radii.half_mass, z: step.z, t: step.t, kravtsov },
            candidates,
            central_iords: cluster.iords,
            strategy: cluster.strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::halonums::ManualHaloNumbers;
    use crate::index::MainBranch;
    use crate::radius::RadiusError;
    use darktrace_common::{BandParams, CosmologyConfig, Halo, HaloCatalogue, SnapshotData, SnapshotFormat, TaggedRecord};
    use std::cell::Cell;
    use std::collections::HashMap;

    struct MemoryIndex {
        outputs: Vec<String>,
        halonums: Vec<u64>,
        t_latest_first: Vec<f64>,
        z_latest_first: Vec<f64>,
        r200c: Option<f64>,
    }

    impl IndexingProvider for MemoryIndex {
        fn main_branch(&self) -> Result<MainBranch> {
            Ok(MainBranch { outputs: self.outputs.clone(), halonums: self.halonums.clone() })
        }
        fn progenitor_times(&self) -> Result<Vec<f64>> {
            Ok(self.t_latest_first.clone())
        }
        fn progenitor_redshifts(&self) -> Result<Vec<f64>> {
            Ok(self.z_latest_first.clone())
        }
        fn halo_r200c(&self, _output: &str, _halonum: u64) -> Option<f64> {
            self.r200c
        }
    }

    #[derive(Default)]
    struct MemorySource {
        snapshots: HashMap<String, SnapshotData>,
        loads: Cell<usize>,
    }

    impl SnapshotSource for MemorySource {
        fn load(&self, output: &str) -> Result<SnapshotData> {
            self.loads.set(self.loads.get() + 1);
            self.snapshots
                .get(output)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no particle data for {}", output))
        }
    }

    fn params() -> RunParams {
        RunParams {
            eps: 0.05,
            min_samples: 2.0,
            child_depth: 1,
            band: "v".into(),
            band_params: BandParams { ml_ref: 5.0, age_ref_gyr: 10.0, alpha: 0.9 },
            cylindrical: false,
            min_age_gyr: 0.01,
            cosmology: CosmologyConfig::default(),
            overdensity: 200.0,
            kravtsov_fraction: 0.02,
            snapshot_format: SnapshotFormat::Json,
        }
    }

    const CORE_FIRST_IORD: u64 = 1;
    const CHILD_FIRST_IORD: u64 = 1000;
    const HALO_FIRST_IORD: u64 = 5000;

    fn push(set: &mut ParticleSet, iord: u64, x: f64, y: f64, z: f64) {
        set.iord.push(iord);
        set.x.push(x);
        set.y.push(y);
        set.z.push(z);
        set.mass.push(1.0e5);
    }

    /// Host halo at `offset`: a 5x5 tagged core with 0.01 kpc spacing, a
    /// point-symmetric untagged envelope, and a sub-halo clump at +0.6 kpc in x.
    fn snapshot(output: &str, offset: (f64, f64, f64), core_size: usize) -> SnapshotData {
        let mut dm = ParticleSet::default();
        let (ox, oy, oz) = offset;
        let mut iord = CORE_FIRST_IORD;
        for i in 0..core_size {
            let gx = (i % 5) as f64 - 2.0;
            let gy = (i / 5) as f64 - 2.0;
            push(&mut dm, iord, ox + gx * 0.01, oy + gy * 0.01, oz);
            iord += 1;
        }
        for k in 0..10 {
            push(&mut dm, CHILD_FIRST_IORD + k, ox + 0.6 + k as f64 * 0.005, oy, oz);
        }
        let mut envelope = HALO_FIRST_IORD;
        for k in 0..150 {
            let theta = k as f64 * 2.399_963;
            let phi = (k as f64 * 0.731).sin();
            let r = 0.2 + 0.8 * k as f64 / 150.0;
            let (dx, dy, dz) = (r * theta.cos() * phi.cos(), r * theta.sin() * phi.cos(), r * phi.sin());
            push(&mut dm, envelope, ox + dx, oy + dy, oz + dz);
            push(&mut dm, envelope + 1, ox - dx, oy - dy, oz - dz);
            envelope += 2;
        }

        let child = Halo {
            id: 2,
            dm_iords: Some((CHILD_FIRST_IORD..CHILD_FIRST_IORD + 10).collect()),
            ..Default::default()
        };
        let mut host = Halo { id: 1, dm_iords: Some(dm.iord.clone()), ..Default::default() };
        host.properties.children = Some(vec![2]);

        SnapshotData { output: output.into(), dm, stars: None, halos: HaloCatalogue::new(vec![host, child]) }
    }

    fn tagged(core_size: usize) -> TaggedParticles {
        let mut records: Vec<TaggedRecord> = (0..core_size as u64)
            .map(|i| TaggedRecord { iords: CORE_FIRST_IORD + i, t: 0.5, mstar: 100.0 })
            .collect();
        records.extend((0..10).map(|k| TaggedRecord { iords: CHILD_FIRST_IORD + k, t: 0.5, mstar: 100.0 }));
        TaggedParticles::new(records)
    }

    fn pipeline(outputs: &[&str], source: MemorySource) -> ReffPipeline<MemoryIndex, MemorySource> {
        pipeline_with(outputs, source, params(), CatalogueConvention::Hop)
    }

    fn pipeline_with(
        outputs: &[&str],
        source: MemorySource,
        params: RunParams,
        convention: CatalogueConvention,
    ) -> ReffPipeline<MemoryIndex, MemorySource> {
        let n = outputs.len();
        let index = MemoryIndex {
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            halonums: vec![1; n],
            t_latest_first: (1..=n).rev().map(|i| i as f64).collect(),
            z_latest_first: (1..=n).map(|i| i as f64 * 0.1).collect(),
            r200c: Some(25.0),
        };
        ReffPipeline::new(params, SimulationState::Dmo, index, source, convention)
    }

    fn single(snap: SnapshotData) -> MemorySource {
        let mut source = MemorySource::default();
        source.snapshots.insert(snap.output.clone(), snap);
        source
    }

    fn first_step<I: IndexingProvider, S: SnapshotSource>(p: &ReffPipeline<I, S>) -> SnapshotStep {
        p.snapshot_steps().unwrap().unwrap().remove(0)
    }

    struct FailingHalfLight;

    impl HalfLightEstimator for FailingHalfLight {
        fn half_light_radius(&self, _: &ParticleSet, _: &[f64], _: &str, _: bool) -> Result<f64, RadiusError> {
            Err(RadiusError::Empty)
        }
    }

    #[test]
    fn index_mismatch_returns_sentinel_without_loading() {
        let outputs: Vec<String> = (0..10).map(|i| format!("output_{:05}", i)).collect();
        let index = MemoryIndex {
            outputs,
            halonums: vec![1; 10],
            t_latest_first: vec![1.0; 10],
            z_latest_first: vec![0.0; 9],
            r200c: None,
        };
        let p = ReffPipeline::new(params(), SimulationState::Dmo, index, MemorySource::default(), CatalogueConvention::Hop);
        let result = p.run(&tagged(25)).unwrap();
        assert_eq!(result, RunResult::IndexMismatch { outputs: 10, redshifts: 9, times: 10 });
        assert_eq!(p.source.loads.get(), 0);
    }

    #[test]
    fn end_to_end_emits_rows_in_time_order() {
        let mut source = MemorySource::default();
        source.snapshots.insert("output_00001".into(), snapshot("output_00001", (5.0, -3.0, 2.0), 25));
        source.snapshots.insert("output_00002".into(), snapshot("output_00002", (5.1, -3.0, 2.0), 25));
        let p = pipeline(&["output_00001", "output_00002"], source);

        let RunResult::Completed { table, summary } = p.run(&tagged(25)).unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.emitted, 2);
        assert_eq!(table.len(), 2);
        let rows = table.rows();
        // Chronological: progenitor times [2, 1] reversed.
        assert_eq!(rows[0].t, 1.0);
        assert_eq!(rows[1].t, 2.0);
        assert!((rows[0].z - 0.2).abs() < 1e-12);
        for row in rows {
            // 5x5 grid, equal masses: cumulative 1,5,9,13 reaches 12.5 at r = 0.02.
            assert!((row.reff - 0.02).abs() < 1e-9, "reff = {}", row.reff);
            assert!((row.halflight - 0.02).abs() < 1e-9, "halflight = {}", row.halflight);
            assert!((row.kravtsov - 0.5).abs() < 1e-12);
        }

        let (_, SnapshotOutcome::Emitted(second)) = &summary.outcomes[1] else {
            panic!("second snapshot should emit");
        };
        assert_eq!(second.strategy, SelectionStrategy::Continuity);
        assert_eq!(second.central_iords, (CORE_FIRST_IORD..CORE_FIRST_IORD + 25).collect::<Vec<_>>());
    }

    #[test]
    fn child_particles_never_reach_clustering() {
        let mut source = MemorySource::default();
        source.snapshots.insert("output_00001".into(), snapshot("output_00001", (0.0, 0.0, 0.0), 25));
        let p = pipeline(&["output_00001"], source);
        let step = p.snapshot_steps().unwrap().unwrap().remove(0);
        let table = tagged(25);
        let mass = table.cumulative_at(step.t);

        let (outcome, next) = p.process_snapshot(&step, &table, ContinuityState::empty());
        let SnapshotOutcome::Emitted(emitted) = outcome else {
            panic!("expected a row, got {:?}", outcome);
        };
        // 25 core particles are candidates; the 10 tagged sub-halo particles are not.
        assert_eq!(emitted.candidates, 25);
        assert!(emitted.central_iords.iter().all(|&i| i < CHILD_FIRST_IORD));
        assert!(!next.contains(CHILD_FIRST_IORD));
        assert_eq!(next.len(), 25);

        let snap = snapshot("output_00001", (0.0, 0.0, 0.0), 25);
        let excluded: HashSet<u64> = (CHILD_FIRST_IORD..CHILD_FIRST_IORD + 10).collect();
        let candidates = in_situ_candidates(&snap.dm, &excluded, &mass);
        assert!(candidates.iord.iter().all(|i| !excluded.contains(i)));
        assert_eq!(candidates.len(), 25);
    }

    #[test]
    fn two_candidates_skip_without_row() {
        let mut source = MemorySource::default();
        source.snapshots.insert("output_00001".into(), snapshot("output_00001", (0.0, 0.0, 0.0), 2));
        let p = pipeline(&["output_00001"], source);
        let RunResult::Completed { table, summary } = p.run(&tagged(2)).unwrap() else {
            panic!("expected a completed run");
        };
        assert!(table.is_empty());
        assert_eq!(summary.skipped.get("too_few_particles"), Some(&1));
        assert_eq!(
            summary.outcomes[0].1,
            SnapshotOutcome::Skipped(SkipReason::TooFewParticles { count: 2 })
        );
    }

    #[test]
    fn unreadable_snapshot_is_skipped_and_loop_continues() {
        let mut source = MemorySource::default();
        source.snapshots.insert("output_00002".into(), snapshot("output_00002", (0.0, 0.0, 0.0), 25));
        let p = pipeline(&["output_00001", "output_00002"], source);
        let RunResult::Completed { table, summary } = p.run(&tagged(25)).unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(table.len(), 1);
        assert_eq!(summary.skipped.get("load_failed"), Some(&1));
        assert_eq!(p.source.loads.get(), 2);
    }

    #[test]
    fn snapshots_before_first_tag_are_skipped_without_loading() {
        let p = pipeline(&["output_00001"], MemorySource::default());
        let late = TaggedParticles::new(vec![TaggedRecord { iords: 1, t: 50.0, mstar: 1.0 }]);
        let RunResult::Completed { summary, .. } = p.run(&late).unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.outcomes[0].1, SnapshotOutcome::Skipped(SkipReason::NoTaggedParticles));
        assert_eq!(p.source.loads.get(), 0);
    }

    #[test]
    fn zero_tagged_mass_is_skipped() {
        let p = pipeline(&["output_00001"], MemorySource::default());
        let zero = TaggedParticles::new(vec![TaggedRecord { iords: 1, t: 0.1, mstar: 0.0 }]);
        let RunResult::Completed { summary, .. } = p.run(&zero).unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.outcomes[0].1, SnapshotOutcome::Skipped(SkipReason::ZeroTaggedMass));
    }

    #[test]
    fn early_skip_keeps_incoming_continuity() {
        let p = pipeline(&["output_00001"], MemorySource::default());
        let step = p.snapshot_steps().unwrap().unwrap().remove(0);
        let prev = ContinuityState::from_iords([7, 8, 9]);
        let (outcome, next) = p.process_snapshot(&step, &tagged(25), prev.clone());
        assert!(matches!(outcome, SnapshotOutcome::Skipped(SkipReason::LoadFailed(_))));
        assert_eq!(next, prev);
    }

    #[test]
    fn missing_halo_is_skipped() {
        let mut source = MemorySource::default();
        source.snapshots.insert("output_00001".into(), snapshot("output_00001", (0.0, 0.0, 0.0), 25));
        let index = MemoryIndex {
            outputs: vec!["output_00001".into()],
            halonums: vec![9],
            t_latest_first: vec![1.0],
            z_latest_first: vec![0.0],
            r200c: None,
        };
        let p = ReffPipeline::new(params(), SimulationState::Dmo, index, source, CatalogueConvention::Hop);
        let RunResult::Completed { summary, .. } = p.run(&tagged(25)).unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.skipped.get("halo_not_found"), Some(&1));
    }

    #[test]
    fn untagged_host_has_no_candidates() {
        let p = pipeline(&["output_00001"], single(snapshot("output_00001", (0.0, 0.0, 0.0), 25)));
        let step = first_step(&p);
        let elsewhere = TaggedParticles::new(vec![TaggedRecord { iords: 99_999, t: 0.5, mstar: 10.0 }]);
        let prev = ContinuityState::from_iords([3, 4]);
        let (outcome, next) = p.process_snapshot(&step, &elsewhere, prev.clone());
        assert_eq!(outcome, SnapshotOutcome::Skipped(SkipReason::EmptyCandidates));
        assert_eq!(next, prev);
    }

    #[test]
    fn host_without_members_cannot_be_centred() {
        let mut snap = snapshot("output_00001", (0.0, 0.0, 0.0), 25);
        snap.halos.halos[0].dm_iords = Some(Vec::new());
        let p = pipeline(&["output_00001"], single(snap));
        let step = first_step(&p);
        let (outcome, next) = p.process_snapshot(&step, &tagged(25), ContinuityState::empty());
        let SnapshotOutcome::Skipped(SkipReason::CenteringFailed(msg)) = outcome else {
            panic!("expected a centering failure, got {:?}", outcome);
        };
        assert!(msg.contains("no dark matter members"), "{}", msg);
        assert!(next.is_empty());
    }

    #[test]
    fn unreachable_overdensity_fails_virial_radius() {
        let mut unreachable = params();
        unreachable.overdensity = f64::INFINITY;
        let source = single(snapshot("output_00001", (0.0, 0.0, 0.0), 25));
        let p = pipeline_with(&["output_00001"], source, unreachable, CatalogueConvention::Hop);
        let step = first_step(&p);
        let prev = ContinuityState::from_iords([1, 2, 3]);
        let (outcome, next) = p.process_snapshot(&step, &tagged(25), prev.clone());
        assert!(
            matches!(outcome, SnapshotOutcome::Skipped(SkipReason::VirialRadiusFailed(_))),
            "{:?}",
            outcome
        );
        assert_eq!(next, prev);
    }

    #[test]
    fn all_noise_candidates_yield_no_cluster() {
        let mut sparse = params();
        sparse.min_samples = 1.0e12;
        let source = single(snapshot("output_00001", (0.0, 0.0, 0.0), 25));
        let p = pipeline_with(&["output_00001"], source, sparse, CatalogueConvention::Hop);
        let step = first_step(&p);
        let prev = ContinuityState::from_iords([1, 2, 3]);
        let (outcome, next) = p.process_snapshot(&step, &tagged(25), prev.clone());
        let SnapshotOutcome::Skipped(reason) = outcome else {
            panic!("expected a skip, got {:?}", outcome);
        };
        assert!(matches!(reason, SkipReason::NoCluster(_)), "{:?}", reason);
        assert_eq!(reason.kind(), "no_cluster");
        assert_eq!(next, prev);
    }

    #[test]
    fn radius_failure_still_replaces_continuity() {
        let p = pipeline(&["output_00001"], single(snapshot("output_00001", (0.0, 0.0, 0.0), 25)))
            .with_half_light_estimator(Box::new(FailingHalfLight));
        let step = first_step(&p);
        let prev = ContinuityState::from_iords([7, 8, 9]);
        let (outcome, next) = p.process_snapshot(&step, &tagged(25), prev.clone());
        assert!(
            matches!(outcome, SnapshotOutcome::Skipped(SkipReason::RadiusFailed(_))),
            "{:?}",
            outcome
        );
        assert_ne!(next, prev);
        assert_eq!(next.len(), 25);
        assert!((CORE_FIRST_IORD..CORE_FIRST_IORD + 25).all(|i| next.contains(i)));
    }

    #[test]
    fn ahf_run_uses_manual_halo_number_and_excludes_children() {
        let manual = ManualHaloNumbers::from_pairs([("output_00001".to_string(), 1)]);
        let source = single(snapshot("output_00001", (1.0, 2.0, 3.0), 25));
        let mut p = pipeline_with(&["output_00001"], source, params(), CatalogueConvention::Ahf(manual));
        // The index halo number is ignored under AHF.
        p.index.halonums = vec![77];
        let step = first_step(&p);
        assert_eq!(step.halonum, 77);

        let (outcome, next) = p.process_snapshot(&step, &tagged(25), ContinuityState::empty());
        let SnapshotOutcome::Emitted(emitted) = outcome else {
            panic!("expected a row, got {:?}", outcome);
        };
        assert_eq!(emitted.candidates, 25);
        assert_eq!(emitted.strategy, SelectionStrategy::Largest);
        assert!(emitted.central_iords.iter().all(|&i| i < CHILD_FIRST_IORD));
        assert!((emitted.row.reff - 0.02).abs() < 1e-9, "reff = {}", emitted.row.reff);
        assert_eq!(next.len(), 25);
    }

    #[test]
    fn ahf_snapshot_without_manual_number_is_skipped() {
        let manual = ManualHaloNumbers::from_pairs([("output_00099".to_string(), 1)]);
        let source = single(snapshot("output_00001", (0.0, 0.0, 0.0), 25));
        let p = pipeline_with(&["output_00001"], source, params(), CatalogueConvention::Ahf(manual));
        let step = first_step(&p);
        let (outcome, _) = p.process_snapshot(&step, &tagged(25), ContinuityState::empty());
        assert!(
            matches!(outcome, SnapshotOutcome::Skipped(SkipReason::HaloNotFound(_))),
            "{:?}",
            outcome
        );
    }

    #[test]
    fn mismatched_clustering_input_is_not_reported_as_missing_cluster() {
        let reason = SkipReason::from(ClusterError::LengthMismatch { points: 4, weights: 3, iords: 4 });
        assert!(matches!(reason, SkipReason::ClusterInput(_)), "{:?}", reason);
        assert_eq!(reason.kind(), "cluster_input");
        assert!(reason.to_string().contains("4 points, 3 weights"), "{}", reason);

        let reason = SkipReason::from(ClusterError::NoCluster { candidates: 12 });
        assert_eq!(reason.kind(), "no_cluster");
        assert_eq!(SkipReason::from(ClusterError::TooFewParticles { count: 2 }), SkipReason::TooFewParticles { count: 2 });
    }
}
