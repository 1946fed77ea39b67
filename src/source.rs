use anyhow::{Context, Result};
use darktrace_common::{SnapshotData, SnapshotFormat};
use log::debug;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Loads the particle and halo data of one simulation output.
pub trait SnapshotSource {
    fn load(&self, output: &str) -> Result<SnapshotData>;
}

/// Reads `<root>/<output>.<ext>` in the configured serialization format.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    root: PathBuf,
    format: SnapshotFormat,
}

impl FileSnapshotSource {
    pub fn new<P: Into<PathBuf>>(root: P, format: SnapshotFormat) -> Self {
        FileSnapshotSource { root: root.into(), format }
    }

    /// Particle data for `sim_name` lives in `<pynbody_path>/<sim_name>/`.
    pub fn for_simulation(pynbody_path: &Path, sim_name: &str, format: SnapshotFormat) -> Self {
        Self::new(pynbody_path.join(sim_name), format)
    }

    pub fn path_for(&self, output: &str) -> PathBuf {
        self.root.join(format!("{}.{}", output, self.format.extension()))
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn load(&self, output: &str) -> Result<SnapshotData> {
        let path = self.path_for(output);
        let data = read_snapshot(&path, self.format)?;
        data.dm
            .validate()
            .with_context(|| format!("Corrupt dark matter arrays in '{}'", path.display()))?;
        if let Some(stars) = &data.stars {
            stars
                .validate()
                .with_context(|| format!("Corrupt star arrays in '{}'", path.display()))?;
        }
        debug!(
            "Loaded {} ({} dm particles, {} halos)",
            path.display(),
            data.dm.len(),
            data.halos.len()
        );
        Ok(data)
    }
}

/// Deserializes a snapshot file.
pub fn read_snapshot(path: &Path, format: SnapshotFormat) -> Result<SnapshotData> {
    let file = File::open(path).with_context(|| format!("Failed to open snapshot '{}'", path.display()))?;
    let reader = BufReader::new(file);
    let data = match format {
        SnapshotFormat::Json => serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse JSON snapshot '{}'", path.display()))?,
        SnapshotFormat::Bincode => bincode::deserialize_from(reader)
            .with_context(|| format!("Failed to decode bincode snapshot '{}'", path.display()))?,
        SnapshotFormat::MessagePack => rmp_serde::decode::from_read(reader)
            .with_context(|| format!("Failed to decode MessagePack snapshot '{}'", path.display()))?,
    };
    Ok(data)
}

/// Serializes a snapshot file in any of the supported formats.
pub fn write_snapshot(path: &Path, data: &SnapshotData, format: SnapshotFormat) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create snapshot '{}'", path.display()))?;
    let mut writer = BufWriter::new(file);
    match format {
        SnapshotFormat::Json => serde_json::to_writer(&mut writer, data)?,
        SnapshotFormat::Bincode => bincode::serialize_into(&mut writer, data)?,
        SnapshotFormat::MessagePack => rmp_serde::encode::write(&mut writer, data)?,
    }
    writer.flush()?;
    Ok(())
}
