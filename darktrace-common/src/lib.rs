pub mod config;
pub mod run_params;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{DarktraceConfig, PathsConfig, TaggingConfig, DarklightConfig, ClusteringConfig, ChildrenConfig, LuminosityConfig, BandParams, CosmologyConfig, OutputConfig, SnapshotFormat};
pub use run_params::RunParams;
pub use snapshot::{dmo_simulation_name, SimulationState, ParticleSet, Halo, HaloProperties, HaloCatalogue, SnapshotData, TaggedRecord, ResultRow};
pub use vecmath::{Vec3, weighted_mean};
