//! Region ID table consumed by the orders worker's full-market sweep. The
//! table itself is an external collaborator (an embedded static list in
//! the original); this module only consumes "a sequence of region IDs",
//! seeded here from the same external-CSV pattern as [`crate::systems`].

use std::path::Path;

use csv::ReaderBuilder;
use serde::Deserialize;

use crate::error::{HoarderError, Result};

#[derive(Debug, Deserialize)]
struct RegionRow {
    #[serde(rename = "regionID")]
    region_id: u64,
}

pub fn load_from_csv(path: impl AsRef<Path>) -> Result<Vec<u64>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path.as_ref())
        .map_err(|e| HoarderError::Parse(format!("regions csv: {e}")))?;

    let mut ids = Vec::new();
    for record in reader.deserialize::<RegionRow>() {
        let row = record.map_err(|e| HoarderError::Parse(format!("regions csv row: {e}")))?;
        ids.push(row.region_id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_region_ids() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "regionID").unwrap();
        writeln!(file, "10000002").unwrap();
        writeln!(file, "10000043").unwrap();
        let ids = load_from_csv(file.path()).unwrap();
        assert_eq!(ids, vec![10000002, 10000043]);
    }
}
