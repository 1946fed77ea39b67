use anyhow::{Context, Result};
use darktrace_common::{Halo, HaloCatalogue};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ManualRow {
    snapshot: String,
    #[serde(rename = "AHF halonum")]
    halonum: u64,
}

/// Hand-picked AHF halo numbers of the main halo, keyed by snapshot name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualHaloNumbers {
    by_snapshot: BTreeMap<String, u64>,
}

impl ManualHaloNumbers {
    /// Reads a delimited table with columns `snapshot` and `AHF halonum`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open manual halo numbers '{}'", path.display()))?;
        let mut by_snapshot = BTreeMap::new();
        for row in reader.deserialize::<ManualRow>() {
            let row = row.with_context(|| format!("Bad row in '{}'", path.display()))?;
            by_snapshot.insert(row.snapshot.trim().to_string(), row.halonum);
        }
        Ok(ManualHaloNumbers { by_snapshot })
    }

    pub fn from_pairs<I: IntoIterator<Item = (String, u64)>>(pairs: I) -> Self {
        ManualHaloNumbers { by_snapshot: pairs.into_iter().collect() }
    }

    pub fn get(&self, snapshot: &str) -> Option<u64> {
        self.by_snapshot.get(snapshot).copied()
    }

    pub fn len(&self) -> usize {
        self.by_snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_snapshot.is_empty()
    }
}

/// Which halo-finder numbering to use when looking up the main halo.
/// Passed explicitly to every catalogue lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogueConvention {
    /// AHF catalogue, main halo given per snapshot by manual halo numbers.
    Ahf(ManualHaloNumbers),
    /// HOP catalogue, main halo is the `halonum`-th entry (1-based).
    Hop,
}

impl CatalogueConvention {
    /// AHF when the override file exists and has rows, HOP otherwise.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No manual halo numbers configured, using HOP catalogue");
            return Ok(CatalogueConvention::Hop);
        };
        if !path.is_file() {
            info!("Manual halo numbers file at {} does not exist, using HOP catalogue", path.display());
            return Ok(CatalogueConvention::Hop);
        }
        let manual = ManualHaloNumbers::load(path)?;
        if manual.is_empty() {
            info!("Manual halo numbers file at {} is empty, using HOP catalogue", path.display());
            Ok(CatalogueConvention::Hop)
        } else {
            info!("Using AHF catalogue with {} manual halo numbers", manual.len());
            Ok(CatalogueConvention::Ahf(manual))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CatalogueConvention::Ahf(_) => "AHF",
            CatalogueConvention::Hop => "HOP",
        }
    }

    /// Finds the main halo of `output` in `catalogue`.
    /// `halonum` is the main-branch halo number from the merger tree (used by HOP).
    pub fn locate_main_halo<'a>(&self, catalogue: &'a HaloCatalogue, output: &str, halonum: u64) -> Result<&'a Halo> {
        match self {
            CatalogueConvention::Ahf(manual) => {
                let id = manual
                    .get(output)
                    .with_context(|| format!("no manual AHF halo number for snapshot {}", output))?;
                catalogue
                    .get(id)
                    .with_context(|| format!("AHF halo {} not in catalogue of {}", id, output))
            }
            CatalogueConvention::Hop => {
                let halo = catalogue.nth_1based(halonum);
                if halo.is_none() {
                    warn!("HOP catalogue of {} has {} halos, wanted #{}", output, catalogue.len(), halonum);
                }
                halo.with_context(|| format!("HOP halo #{} not in catalogue of {}", halonum, output))
            }
        }
    }
}
