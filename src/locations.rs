//! Locations worker: resolves structure/station IDs referenced by orders
//! into metadata, blacklisting IDs the API refuses to serve.

use std::collections::HashSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use csv::ReaderBuilder;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dump::{DumpReader, DumpType, DumpWriter};
use crate::error::{HoarderError, Result};
use crate::runtime::Runtime;

const LOCATION_FETCH_MAX_ATTEMPTS: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub id: u64,
    pub type_id: u64,
    pub owner_id: u64,
    pub system_id: u64,
    pub security: f32,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct BaselineRow {
    #[serde(rename = "stationID")]
    station_id: u64,
    security: f32,
    #[serde(rename = "stationTypeID")]
    station_type_id: u64,
    #[serde(rename = "corporationID")]
    corporation_id: u64,
    #[serde(rename = "solarSystemID")]
    solar_system_id: u64,
    #[serde(rename = "stationName")]
    station_name: String,
}

/// Reads the baseline (NPC station) location seed: header
/// `stationID,security,stationTypeID,corporationID,solarSystemID,stationName`.
pub fn load_baseline_csv(path: impl AsRef<Path>) -> Result<Vec<Location>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path.as_ref())
        .map_err(|e| HoarderError::Parse(format!("locations csv: {e}")))?;

    let mut locations = Vec::new();
    for record in reader.deserialize::<BaselineRow>() {
        let row = record.map_err(|e| HoarderError::Parse(format!("locations csv row: {e}")))?;
        locations.push(Location {
            id: row.station_id,
            type_id: row.station_type_id,
            owner_id: row.corporation_id,
            system_id: row.solar_system_id,
            security: row.security,
            name: row.station_name,
        });
    }
    Ok(locations)
}

#[derive(Debug, Deserialize)]
struct StructureJson {
    name: String,
    owner_id: u64,
    solar_system_id: u64,
    type_id: u64,
}

pub fn write_location(writer: &mut DumpWriter, location: &Location) -> Result<()> {
    writer.write_u64(location.id)?;
    writer.write_u64(location.type_id)?;
    writer.write_u64(location.owner_id)?;
    writer.write_u64(location.system_id)?;
    writer.write_f32(location.security)?;
    writer.write_string(&location.name)
}

pub fn read_location(reader: &mut DumpReader) -> Result<Location> {
    Ok(Location {
        id: reader.read_u64()?,
        type_id: reader.read_u64()?,
        owner_id: reader.read_u64()?,
        system_id: reader.read_u64()?,
        security: reader.read_f32()?,
        name: reader.read_string()?,
    })
}

enum FetchOutcome {
    Found(Location),
    Forbidden,
    Skipped,
}

async fn fetch_location(runtime: &Runtime, id: u64) -> FetchOutcome {
    let path = format!("/universe/structures/{id}/");
    let result = runtime
        .esi
        .fetch(
            reqwest::Method::GET,
            &path,
            &[],
            None,
            true,
            runtime.oauth.as_ref(),
            LOCATION_FETCH_MAX_ATTEMPTS,
        )
        .await;

    match result {
        Ok(response) => match serde_json::from_str::<StructureJson>(&response.body) {
            Ok(parsed) => FetchOutcome::Found(Location {
                id,
                type_id: parsed.type_id,
                owner_id: parsed.owner_id,
                system_id: parsed.solar_system_id,
                security: runtime.systems.get_security(parsed.solar_system_id),
                name: parsed.name,
            }),
            Err(err) => {
                warn!(id, %err, "malformed structure body, skipping");
                FetchOutcome::Skipped
            }
        },
        Err(HoarderError::UpstreamRejected(reason)) => {
            warn!(id, %reason, "structure blacklisted");
            FetchOutcome::Forbidden
        }
        Err(err) => {
            warn!(id, %err, "structure fetch failed, skipping for now");
            FetchOutcome::Skipped
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

pub async fn run(
    runtime: std::sync::Arc<Runtime>,
    baseline_csv_path: impl AsRef<Path>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let runtime = runtime.as_ref();
    let mut locations = load_baseline_csv(baseline_csv_path)?;
    let mut known_ids: HashSet<u64> = locations.iter().map(|l| l.id).collect();
    let mut forbidden: HashSet<u64> = HashSet::new();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let batch = tokio::select! {
            popped = runtime.orders_to_locations.pop(None) => match popped {
                Ok(batch) => batch,
                Err(_) => continue,
            },
            _ = shutdown.changed() => continue,
        };

        let mut added = false;
        for id in batch {
            if known_ids.contains(&id) || forbidden.contains(&id) {
                continue;
            }
            match fetch_location(runtime, id).await {
                FetchOutcome::Found(location) => {
                    known_ids.insert(location.id);
                    locations.push(location);
                    added = true;
                }
                FetchOutcome::Forbidden => {
                    forbidden.insert(id);
                }
                FetchOutcome::Skipped => {}
            }
        }

        if added {
            let now = now_epoch();
            let path = runtime.dump_path(format!("loc-{now}.dump"));
            let mut writer = DumpWriter::open(&runtime.dump_registry, &path, DumpType::Locations, 0)?;
            for location in &locations {
                write_location(&mut writer, location)?;
            }
            writer.close()?;
            info!(total = locations.len(), "locations dump written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, tempdir};

    #[test]
    fn loads_baseline_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "stationID,security,stationTypeID,corporationID,solarSystemID,stationName"
        )
        .unwrap();
        writeln!(file, "60003760,0.9,1531,1000035,30000142,Jita IV - Moon 4").unwrap();
        let locations = load_baseline_csv(file.path()).unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].id, 60003760);
        assert_eq!(locations[0].name, "Jita IV - Moon 4");
    }

    #[test]
    fn location_round_trips_through_a_dump() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loc-test.dump");
        let registry = crate::dump::DumpRegistry::new();
        let location = Location {
            id: 1,
            type_id: 2,
            owner_id: 3,
            system_id: 4,
            security: 0.5,
            name: "Test Station".into(),
        };

        let mut writer = DumpWriter::open(&registry, &path, DumpType::Locations, 0).unwrap();
        write_location(&mut writer, &location).unwrap();
        writer.close().unwrap();

        let mut reader = DumpReader::open(&path).unwrap();
        assert_eq!(read_location(&mut reader).unwrap(), location);
    }
}
