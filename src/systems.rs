//! Solar system security-rating lookup, seeded from an external CSV (the
//! data source itself is an external collaborator; this module only
//! consumes "a sequence of (system_id, security) records").

use std::path::Path;

use csv::ReaderBuilder;
use serde::Deserialize;

use crate::error::{HoarderError, Result};

#[derive(Debug, Deserialize)]
struct SystemRow {
    #[serde(rename = "solarSystemID")]
    solar_system_id: u64,
    security: f32,
}

#[derive(Debug, Default)]
pub struct SystemTable {
    entries: Vec<(u64, f32)>,
}

impl SystemTable {
    pub fn load_from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path.as_ref())
            .map_err(|e| HoarderError::Parse(format!("systems csv: {e}")))?;

        let mut entries = Vec::new();
        for record in reader.deserialize::<SystemRow>() {
            let row = record.map_err(|e| HoarderError::Parse(format!("systems csv row: {e}")))?;
            entries.push((row.solar_system_id, row.security));
        }
        Ok(Self { entries })
    }

    /// Linear scan; returns 0.0 when the system isn't in the table.
    pub fn get_security(&self, system_id: u64) -> f32 {
        self.entries
            .iter()
            .find(|(id, _)| *id == system_id)
            .map(|(_, security)| *security)
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn seed_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "solarSystemID,security").unwrap();
        writeln!(file, "30000142,0.9").unwrap();
        writeln!(file, "30000144,-0.5").unwrap();
        file
    }

    #[test]
    fn loads_and_looks_up() {
        let file = seed_csv();
        let table = SystemTable::load_from_csv(file.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get_security(30000142), 0.9);
    }

    #[test]
    fn missing_system_returns_zero() {
        let file = seed_csv();
        let table = SystemTable::load_from_csv(file.path()).unwrap();
        assert_eq!(table.get_security(999), 0.0);
    }
}
