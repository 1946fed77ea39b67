use anyhow::{Context, Result};
use darktrace_common::TaggedRecord;
use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

// Row as written by the tagging step; extra columns (e.g. a leading index) are ignored.
#[derive(Debug, Deserialize)]
struct RawRecord {
    iords: String,
    t: f64,
    mstar: f64,
}

/// Parses a particle id that may have been written as an integer or as a float ("123.0").
fn parse_iord(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<u64>() {
        return Some(v);
    }
    let f = raw.parse::<f64>().ok()?;
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0).then_some(f as u64)
}

/// The full particle-tagging table, held in memory for the whole run.
#[derive(Debug, Clone, Default)]
pub struct TaggedParticles {
    records: Vec<TaggedRecord>,
}

impl TaggedParticles {
    pub fn new(records: Vec<TaggedRecord>) -> Self {
        TaggedParticles { records }
    }

    /// Reads a delimited table with at least the columns `iords`, `t`, `mstar`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open tagged particle table '{}'", path.display()))?;

        let mut records = Vec::new();
        for (line, row) in reader.deserialize::<RawRecord>().enumerate() {
            let row = row.with_context(|| format!("Bad row {} in '{}'", line + 1, path.display()))?;
            let iords = parse_iord(&row.iords).with_context(|| {
                format!("Row {} in '{}' has invalid iord '{}'", line + 1, path.display(), row.iords)
            })?;
            records.push(TaggedRecord { iords, t: row.t, mstar: row.mstar });
        }
        info!("Loaded {} tagged particle records from {}", records.len(), path.display());
        Ok(TaggedParticles { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TaggedRecord] {
        &self.records
    }

    pub fn has_records_up_to(&self, cutoff: f64) -> bool {
        self.records.iter().any(|r| r.t <= cutoff)
    }

    pub fn records_up_to(&self, cutoff: f64) -> impl Iterator<Item = &TaggedRecord> + '_ {
        self.records.iter().filter(move |r| r.t <= cutoff)
    }

    /// Stellar mass per particle at `cutoff`: the sum of every record with `t <= cutoff`.
    pub fn cumulative_at(&self, cutoff: f64) -> BTreeMap<u64, f64> {
        let mut grouped = BTreeMap::new();
        for r in self.records_up_to(cutoff) {
            *grouped.entry(r.iords).or_insert(0.0) += r.mstar;
        }
        debug!("{} tagged particles at t <= {:.4}", grouped.len(), cutoff);
        grouped
    }
}
