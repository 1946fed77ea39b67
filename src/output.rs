use anyhow::{Context, Result};
use darktrace_common::ResultRow;
use log::info;
use std::path::Path;

/// Effective-radius rows accumulated over the snapshot loop, in time order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReffTable {
    rows: Vec<ResultRow>,
}

impl ReffTable {
    pub fn new() -> Self {
        ReffTable::default()
    }

    pub fn push(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes the table with header `halflight,reff,z,t,kravtsov`.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create output table '{}'", path.display()))?;
        if self.rows.is_empty() {
            // serialize() only emits the header alongside the first row
            writer.write_record(["halflight", "reff", "z", "t", "kravtsov"])?;
        }
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open output table '{}'", path.display()))?;
        let rows = reader
            .deserialize::<ResultRow>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Bad row in '{}'", path.display()))?;
        Ok(ReffTable { rows })
    }

    /// Writes the table when `save` is set; either way hands it back to the caller.
    pub fn finish(self, save: bool, path: &Path) -> Result<Self> {
        info!("---------------- writing output file ----------------");
        if save {
            self.write_csv(path)?;
            info!("wrote {} rows to {}", self.len(), path.display());
        } else {
            info!("reffs not saved to file, to store values enable output.save_to_file");
        }
        Ok(self)
    }
}
