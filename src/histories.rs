//! Histories worker: daily price-history backfill and steady-state
//! collection, anchored on the 11:15 UTC cutover at which upstream
//! considers the prior day's history final.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::date::{self, Date};
use crate::dump::{DumpReader, DumpType, DumpWriter};
use crate::error::Result;
use crate::runtime::Runtime;

const HISTORY_FETCH_MAX_ATTEMPTS: u32 = 5;
const MARKET_REQUEST_TIMEOUT: Duration = Duration::from_secs(3 * 3600);
/// Per-market worker-level backoff on top of the HTTP layer's own
/// 5-retry budget, applied between the 6 attempts this worker makes.
const MARKET_BACKOFF_SCHEDULE: [Duration; 6] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(2 * 3600),
];
const BACKFILL_SCAN_CHUNK: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryBit {
    pub date: Date,
    pub region_id: u64,
    pub type_id: u64,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub order_count: u64,
    pub volume: u64,
}

#[derive(Debug, Deserialize)]
struct HistoryDayJson {
    average: f64,
    highest: f64,
    lowest: f64,
    order_count: u64,
    volume: u64,
    date: String,
}

pub fn write_history_bit(writer: &mut DumpWriter, bit: &HistoryBit) -> Result<()> {
    writer.write_date(bit.date)?;
    writer.write_u64(bit.region_id)?;
    writer.write_u64(bit.type_id)?;
    writer.write_f64(bit.average)?;
    writer.write_f64(bit.highest)?;
    writer.write_f64(bit.lowest)?;
    writer.write_u64(bit.order_count)?;
    writer.write_u64(bit.volume)
}

/// Returns `None` on a clean end-of-stream, `Err` on a torn record.
pub fn read_history_bit_or_eof(reader: &mut DumpReader) -> Result<Option<HistoryBit>> {
    let date = match reader.read_date_or_eof()? {
        Some(d) => d,
        None => return Ok(None),
    };
    Ok(Some(HistoryBit {
        date,
        region_id: reader.read_u64()?,
        type_id: reader.read_u64()?,
        average: reader.read_f64()?,
        highest: reader.read_f64()?,
        lowest: reader.read_f64()?,
        order_count: reader.read_u64()?,
        volume: reader.read_u64()?,
    }))
}

async fn history_download(runtime: &Runtime, region_id: u64, type_id: u64) -> Result<Vec<HistoryBit>> {
    let path = format!("/markets/{region_id}/history/");
    let response = runtime
        .esi
        .fetch(
            reqwest::Method::GET,
            &path,
            &[("type_id", type_id.to_string())],
            None,
            false,
            None,
            HISTORY_FETCH_MAX_ATTEMPTS,
        )
        .await?;

    let raw: Vec<HistoryDayJson> = serde_json::from_str(&response.body)
        .map_err(|e| crate::error::HoarderError::Parse(format!("history body: {e}")))?;

    raw.into_iter()
        .map(|row| {
            let date = Date::parse(&row.date, "%Y-%m-%d")
                .map_err(|e| crate::error::HoarderError::Parse(e.to_string()))?;
            Ok(HistoryBit {
                date,
                region_id,
                type_id,
                average: row.average,
                highest: row.highest,
                lowest: row.lowest,
                order_count: row.order_count,
                volume: row.volume,
            })
        })
        .collect()
}

/// Downloads one market's history, retrying up to 6 times with the
/// worker-level backoff schedule on top of the HTTP layer's own retries.
/// Returns `None` (logged) if every attempt fails.
async fn history_download_with_backoff(
    runtime: &Runtime,
    region_id: u64,
    type_id: u64,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Vec<HistoryBit>> {
    for (attempt, delay) in MARKET_BACKOFF_SCHEDULE.iter().enumerate() {
        match history_download(runtime, region_id, type_id).await {
            Ok(bits) => return Some(bits),
            Err(err) => {
                warn!(region_id, type_id, attempt, %err, "history download failed");
                if attempt + 1 == MARKET_BACKOFF_SCHEDULE.len() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => {}
                    _ = shutdown.changed() => return None,
                }
            }
        }
    }
    warn!(region_id, type_id, "history download exhausted all retries, skipping market");
    None
}

async fn request_active_markets(
    runtime: &Runtime,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Vec<(u64, u64)>> {
    if runtime.market_request.push((), None).await.is_err() {
        return None;
    }
    tokio::select! {
        popped = runtime.market_response.pop(Some(MARKET_REQUEST_TIMEOUT)) => popped.ok(),
        _ = shutdown.changed() => None,
    }
}

fn history_day_path(dump_dir: &Path, date: Date) -> PathBuf {
    dump_dir.join(format!("history-day-{}-{}.dump", date.year, date.day))
}

fn write_day_dump(runtime: &Runtime, date: Date, bits: &[HistoryBit]) -> Result<bool> {
    let path = history_day_path(&runtime.dump_dir, date);
    if path.exists() {
        warn!(path = %path.display(), "history dump already exists, skipping");
        return Ok(false);
    }
    let mut writer = DumpWriter::open(&runtime.dump_registry, &path, DumpType::Histories, 0)?;
    for bit in bits {
        write_history_bit(&mut writer, bit)?;
    }
    writer.close()?;
    Ok(true)
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// One-time backfill: download every active market's full history into a
/// scratch internal dump, then split it into per-day dumps without ever
/// holding the whole multi-day dataset in memory at once.
async fn run_backfill(runtime: &Runtime, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<()> {
    let markets = match request_active_markets(runtime, shutdown).await {
        Some(m) => m,
        None => {
            warn!("backfill: no active markets available within timeout, skipping backfill");
            return Ok(());
        }
    };

    let snapshot_path = std::env::temp_dir().join(format!("hoarder-histories-backfill-{}.dump", now_epoch()));
    let mut writer = DumpWriter::open(&runtime.dump_registry, &snapshot_path, DumpType::Internal, 0)?;
    let mut earliest: Option<Date> = None;
    let mut latest: Option<Date> = None;

    for (region_id, type_id) in markets {
        let Some(bits) = history_download_with_backoff(runtime, region_id, type_id, shutdown).await else {
            continue;
        };
        for bit in &bits {
            write_history_bit(&mut writer, bit)?;
            earliest = Some(earliest.map_or(bit.date, |e| e.min(bit.date)));
            latest = Some(latest.map_or(bit.date, |l| l.max(bit.date)));
        }
    }
    writer.close()?;

    let (Some(earliest), Some(latest)) = (earliest, latest) else {
        info!("backfill collected no history bits");
        let _ = std::fs::remove_file(&snapshot_path);
        return Ok(());
    };

    let mut date = earliest;
    loop {
        emit_day_from_snapshot(runtime, &snapshot_path, date)?;
        if date == latest {
            break;
        }
        date = date.incr();
    }

    std::fs::remove_file(&snapshot_path)?;
    Ok(())
}

/// Streams the snapshot-internal dump in fixed-size chunks, keeping only
/// bits matching `date`, and emits the per-day dump for it.
fn emit_day_from_snapshot(runtime: &Runtime, snapshot_path: &Path, date: Date) -> Result<()> {
    let out_path = history_day_path(&runtime.dump_dir, date);
    if out_path.exists() {
        warn!(path = %out_path.display(), "history dump already exists, skipping");
        return Ok(());
    }

    let mut reader = DumpReader::open(snapshot_path)?;
    let mut matching = Vec::new();
    loop {
        let mut chunk = Vec::with_capacity(BACKFILL_SCAN_CHUNK);
        for _ in 0..BACKFILL_SCAN_CHUNK {
            match read_history_bit_or_eof(&mut reader)? {
                Some(bit) => chunk.push(bit),
                None => break,
            }
        }
        if chunk.is_empty() {
            break;
        }
        let chunk_len = chunk.len();
        matching.extend(chunk.into_iter().filter(|bit| bit.date == date));
        if chunk_len < BACKFILL_SCAN_CHUNK {
            break;
        }
    }

    let mut writer = DumpWriter::open(&runtime.dump_registry, &out_path, DumpType::Histories, 0)?;
    for bit in &matching {
        write_history_bit(&mut writer, bit)?;
    }
    writer.close()
}

fn compute_target_date(now: DateTime<Utc>) -> Date {
    let offset_days = if date::is_before_eleven_fifteen(now) { 2 } else { 1 };
    let target_instant = date::epoch_minus_days(now, offset_days);
    Date::from_epoch(target_instant.timestamp() as u64)
}

pub async fn run(runtime: std::sync::Arc<Runtime>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let runtime = runtime.as_ref();
    let now = Utc::now();
    let backfill_check_date = Date::from_epoch(date::epoch_minus_days(now, 2).timestamp() as u64);
    if !history_day_path(&runtime.dump_dir, backfill_check_date).exists() {
        run_backfill(runtime, &mut shutdown).await?;
    }

    let mut next_tick_due = date::next_eleven_fifteen(Utc::now());

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let now = Utc::now();
        if now < next_tick_due {
            let wait = (next_tick_due - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => continue,
            }
            continue;
        }

        let markets = match request_active_markets(runtime, &mut shutdown).await {
            Some(m) => m,
            None => {
                warn!("daily cycle: no active markets available, skipping today");
                next_tick_due += chrono::Duration::days(1);
                continue;
            }
        };

        let target_date = compute_target_date(Utc::now());
        let mut bits = Vec::new();
        for (region_id, type_id) in markets {
            let Some(downloaded) =
                history_download_with_backoff(runtime, region_id, type_id, &mut shutdown).await
            else {
                continue;
            };
            bits.extend(downloaded.into_iter().filter(|bit| bit.date == target_date));
        }

        match write_day_dump(runtime, target_date, &bits) {
            Ok(true) => info!(year = target_date.year, day = target_date.day, count = bits.len(), "history dump written"),
            Ok(false) => {}
            Err(err) => return Err(err.into()),
        }

        next_tick_due += chrono::Duration::days(1);
    }
}
