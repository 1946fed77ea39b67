use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::time::Instant;

mod children;
mod cluster;
mod geometry;
mod grid;
mod halonums;
mod index;
mod luminosity;
mod output;
mod pipeline;
mod radius;
mod source;
mod tagged;

use darktrace_common::{dmo_simulation_name, DarktraceConfig, SimulationState};
use halonums::CatalogueConvention;
use index::JsonProgenitorIndex;
use luminosity::FadingPowerLaw;
use pipeline::{ReffPipeline, RunResult, SnapshotOutcome};
use source::FileSnapshotSource;
use tagged::TaggedParticles;

/// Effective radii of tagged stellar populations in dark-matter-only simulations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute half-mass, half-light and Kravtsov radii along the main branch
    Run {
        /// Simulation name, e.g. Halo1459_DMO
        #[arg(short, long)]
        sim: String,

        /// Tagged-particle table (CSV with iords, t, mstar)
        #[arg(short, long)]
        tagged: PathBuf,

        /// Output table; defaults to output.filename under paths.output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Expected main halo number in the progenitor index
        #[arg(long)]
        halo: Option<u64>,

        /// Compute the radii without writing the table
        #[arg(long)]
        no_save: bool,
    },
    /// Print every configured path
    Paths,
    /// Check that the configuration loads and its paths exist
    Check,
}

fn main() -> Result<()> {
    Builder::from_default_env()
        .filter(None, LevelFilter::Info)
        .init();

    let args = Args::parse();
    let config = DarktraceConfig::load(&args.config)?;
    debug!("Configuration: {:#?}", config);

    match args.command {
        Command::Run { sim, tagged, output, halo, no_save } => {
            run(&config, &sim, &tagged, output, halo, !no_save && config.output.save_to_file)
        }
        Command::Paths => {
            for (key, path) in config.all_paths() {
                println!("{}: {}", key, path);
            }
            Ok(())
        }
        Command::Check => check(&config),
    }
}

fn run(
    config: &DarktraceConfig,
    sim: &str,
    tagged_path: &Path,
    output: Option<PathBuf>,
    halo: Option<u64>,
    save: bool,
) -> Result<()> {
    let start_time = Instant::now();
    info!("Using {} Rayon threads.", rayon::current_num_threads());

    let dmo_name = dmo_simulation_name(sim);
    let state = SimulationState::from_sim_name(&dmo_name);
    info!("Simulation {} (particle data from {}, {:?})", sim, dmo_name, state);

    let index_path = JsonProgenitorIndex::path_for(&config.paths.tangos_path, sim);
    let index = JsonProgenitorIndex::load(&index_path)?;
    if let Some(expected) = halo {
        if index.halo_number() != expected {
            anyhow::bail!(
                "progenitor index '{}' follows halo {}, not halo {}",
                index_path.display(),
                index.halo_number(),
                expected
            );
        }
    }
    if index.simulation() != dmo_name {
        warn!("progenitor index is for '{}', running '{}'", index.simulation(), dmo_name);
    }

    let manual = config.manual_halonum_path().map(|dir| dir.join("DMO").join(sim));
    let convention = CatalogueConvention::resolve(manual.as_deref())?;

    let params = config.run_params();
    let source = FileSnapshotSource::for_simulation(&config.paths.pynbody_path, &dmo_name, params.snapshot_format);
    let tagged = TaggedParticles::load(tagged_path)?;
    if tagged.is_empty() {
        warn!("{} holds no tagged particles; every snapshot will be skipped", tagged_path.display());
    } else {
        info!("Loaded {} tagged-particle records from {}", tagged.len(), tagged_path.display());
    }

    let pipeline = ReffPipeline::new(params, state, index, source, convention)
        .with_luminosity_model(Box::new(FadingPowerLaw::from_config(&config.luminosity)));

    let progress_bar = ProgressBar::new(0);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} snapshots ({percent}%) [{eta}] {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let result = pipeline.run_with_progress(&tagged, |done, total, outcome| {
        progress_bar.set_length(total as u64);
        progress_bar.set_position(done as u64);
        match outcome {
            SnapshotOutcome::Emitted(emitted) => progress_bar.set_message(format!("reff {:.3}", emitted.row.reff)),
            SnapshotOutcome::Skipped(reason) => progress_bar.set_message(reason.kind()),
        }
    })?;
    progress_bar.finish_and_clear();

    match result {
        RunResult::IndexMismatch { outputs, redshifts, times } => {
            error!(
                "Nothing computed for {}: {} outputs, {} redshifts, {} times",
                sim, outputs, redshifts, times
            );
        }
        RunResult::Completed { table, summary } => {
            let path = output.unwrap_or_else(|| {
                let name = PathBuf::from(&config.output.filename);
                match &config.paths.output_dir {
                    Some(dir) => dir.join(name),
                    None => name,
                }
            });
            let table = table.finish(save, &path)?;
            info!(
                "{} rows from {} snapshots ({} skipped)",
                table.len(),
                summary.outcomes.len(),
                summary.total_skipped()
            );
        }
    }

    info!("Finished in {:.3} seconds.", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn check(config: &DarktraceConfig) -> Result<()> {
    info!("Configuration loaded (ftag = {}, method = {})", config.tagging.ftag, config.tagging.method);
    let mut missing = 0;
    for (key, path) in config.all_paths() {
        if path.is_empty() {
            info!("  - {}: not set", key);
        } else if Path::new(&path).exists() {
            info!("  - {}: {}", key, path);
        } else {
            warn!("  - {}: {} does not exist", key, path);
            missing += 1;
        }
    }
    let params = config.run_params();
    info!(
        "Clustering eps={} min_samples={}, band {} ({} known), {} snapshots",
        params.eps,
        params.min_samples,
        params.band,
        config.luminosity.bands.len(),
        params.snapshot_format.extension()
    );
    if missing > 0 {
        anyhow::bail!("{} configured path(s) do not exist", missing);
    }
    Ok(())
}
