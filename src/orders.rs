//! Orders worker: the five-minute full-market sweep that drives the rest
//! of the pipeline.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dump::{DumpReader, DumpType, DumpWriter};
use crate::error::{HoarderError, Result};
use crate::runtime::Runtime;

const TICK_INTERVAL: Duration = Duration::from_secs(300);
const SWEEP_RETRY_BACKOFF: Duration = Duration::from_secs(120);
const LOCATION_FANOUT_TIMEOUT: Duration = Duration::from_secs(15);
const FETCH_MAX_ATTEMPTS: u32 = 3;
const DUMP_EXPIRATION_OFFSET_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: u64,
    pub type_id: u64,
    pub region_id: u64,
    pub system_id: u64,
    pub location_id: u64,
    pub price: f64,
    pub volume_remain: u64,
    pub volume_total: u64,
    pub min_volume: u64,
    pub duration: u32,
    pub issued: u64,
    pub range: i8,
    pub is_buy_order: bool,
}

#[derive(Debug, Deserialize)]
struct OrderJson {
    order_id: u64,
    type_id: u64,
    system_id: u64,
    location_id: u64,
    price: f64,
    volume_remain: u64,
    volume_total: u64,
    min_volume: u64,
    duration: u32,
    issued: String,
    range: String,
    is_buy_order: bool,
}

/// `"station"=-2, "solarsystem"=-1, "region"=0, else a literal jump
/// count in {1,2,3,4,5,10,20,30,40}`.
fn range_str_to_code(s: &str) -> Result<i8> {
    match s {
        "station" => Ok(-2),
        "solarsystem" => Ok(-1),
        "region" => Ok(0),
        other => {
            let n: i64 = other
                .parse()
                .map_err(|_| HoarderError::Parse(format!("bad order range {other:?}")))?;
            if matches!(n, 1 | 2 | 3 | 4 | 5 | 10 | 20 | 30 | 40) {
                Ok(n as i8)
            } else {
                Err(HoarderError::Parse(format!("bad order range {other:?}")))
            }
        }
    }
}

fn parse_issued(s: &str) -> Result<u64> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .map_err(|e| HoarderError::Parse(format!("bad issued timestamp {s:?}: {e}")))?;
    Ok(Utc.from_utc_datetime(&naive).timestamp() as u64)
}

fn parse_page(body: &str, region_id: u64) -> Result<Vec<Order>> {
    let raw: Vec<OrderJson> =
        serde_json::from_str(body).map_err(|e| HoarderError::Parse(format!("orders page: {e}")))?;
    raw.into_iter()
        .map(|o| {
            Ok(Order {
                order_id: o.order_id,
                type_id: o.type_id,
                region_id,
                system_id: o.system_id,
                location_id: o.location_id,
                price: o.price,
                volume_remain: o.volume_remain,
                volume_total: o.volume_total,
                min_volume: o.min_volume,
                duration: o.duration,
                issued: parse_issued(&o.issued)?,
                range: range_str_to_code(&o.range)?,
                is_buy_order: o.is_buy_order,
            })
        })
        .collect()
}

pub fn write_order(writer: &mut DumpWriter, order: &Order) -> Result<()> {
    writer.write_u64(order.order_id)?;
    writer.write_u64(order.type_id)?;
    writer.write_u64(order.region_id)?;
    writer.write_u64(order.system_id)?;
    writer.write_u64(order.location_id)?;
    writer.write_f64(order.price)?;
    writer.write_u64(order.volume_remain)?;
    writer.write_u64(order.volume_total)?;
    writer.write_u64(order.min_volume)?;
    writer.write_u32(order.duration)?;
    writer.write_u64(order.issued)?;
    writer.write_i8(order.range)?;
    writer.write_u8(order.is_buy_order as u8)
}

pub fn read_order(reader: &mut DumpReader) -> Result<Order> {
    Ok(Order {
        order_id: reader.read_u64()?,
        type_id: reader.read_u64()?,
        region_id: reader.read_u64()?,
        system_id: reader.read_u64()?,
        location_id: reader.read_u64()?,
        price: reader.read_f64()?,
        volume_remain: reader.read_u64()?,
        volume_total: reader.read_u64()?,
        min_volume: reader.read_u64()?,
        duration: reader.read_u32()?,
        issued: reader.read_u64()?,
        range: reader.read_i8()?,
        is_buy_order: reader.read_u8()? != 0,
    })
}

pub fn write_order_table(writer: &mut DumpWriter, orders: &[Order]) -> Result<()> {
    writer.write_u64(orders.len() as u64)?;
    for order in orders {
        write_order(writer, order)?;
    }
    Ok(())
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

async fn fetch_region_page(runtime: &Runtime, region_id: u64, page: u32) -> Result<(Vec<Order>, u32)> {
    let path = format!("/markets/{region_id}/orders/");
    let response = runtime
        .esi
        .fetch(
            reqwest::Method::GET,
            &path,
            &[("page", page.to_string()), ("order_type", "all".to_string())],
            None,
            false,
            None,
            FETCH_MAX_ATTEMPTS,
        )
        .await?;
    let orders = parse_page(&response.body, region_id)?;
    let pages = response.pages.unwrap_or(1).max(1);
    Ok((orders, pages))
}

/// One full sweep of every configured region. Returns the complete order
/// vector, or the first unrecoverable error encountered.
async fn sweep(runtime: &Runtime) -> Result<Vec<Order>> {
    let mut all = Vec::new();
    for &region_id in &runtime.region_ids {
        let (mut orders, mut page_count) = fetch_region_page(runtime, region_id, 1).await?;
        all.append(&mut orders);

        let mut page = 2;
        while page <= page_count {
            let (mut orders, pages) = fetch_region_page(runtime, region_id, page).await?;
            if pages != page_count {
                warn!(region_id, old = page_count, new = pages, "page count drifted mid-sweep");
                page_count = pages;
            }
            all.append(&mut orders);
            page += 1;
        }
    }
    Ok(all)
}

fn distinct_location_ids(orders: &[Order]) -> Vec<u64> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for order in orders {
        if seen.insert(order.location_id) {
            ids.push(order.location_id);
        }
    }
    ids
}

fn distinct_markets(orders: &[Order]) -> Vec<(u64, u64)> {
    let mut seen = HashSet::new();
    let mut markets = Vec::new();
    for order in orders {
        let key = (order.region_id, order.type_id);
        if seen.insert(key) {
            markets.push(key);
        }
    }
    markets
}

pub async fn run(runtime: std::sync::Arc<Runtime>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let runtime = runtime.as_ref();
    let mut orders: Vec<Order> = Vec::new();
    let mut next_tick_due = 0u64;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let now = now_epoch();
        if now < next_tick_due {
            let wait = Duration::from_secs(next_tick_due - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => continue,
            }
            continue;
        }

        orders.clear();
        let swept = loop {
            match sweep(runtime).await {
                Ok(swept) => break swept,
                Err(err) => {
                    warn!(%err, "orders sweep failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(SWEEP_RETRY_BACKOFF) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            }
        };
        orders = swept;
        info!(count = orders.len(), "orders sweep complete");

        let now = now_epoch();
        let path = runtime.dump_path(format!("orders-{now}.dump"));
        let mut writer = DumpWriter::open(
            &runtime.dump_registry,
            &path,
            DumpType::Orders,
            now + DUMP_EXPIRATION_OFFSET_SECS,
        )?;
        write_order_table(&mut writer, &orders)?;
        writer.close()?;

        let location_ids = distinct_location_ids(&orders);
        match runtime
            .orders_to_locations
            .push(location_ids, Some(LOCATION_FANOUT_TIMEOUT))
            .await
        {
            Ok(()) => {}
            Err(_) => warn!("orders->locations fifo full, dropping this tick's location batch"),
        }

        if runtime.market_request.try_pop().await.is_ok() {
            let markets = distinct_markets(&orders);
            if runtime.market_response.push(markets, Some(LOCATION_FANOUT_TIMEOUT)).await.is_err() {
                warn!("active-markets response fifo full, dropping response");
            }
        }

        next_tick_due = now_epoch() + TICK_INTERVAL.as_secs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_order(region_id: u64, location_id: u64) -> Order {
        Order {
            order_id: 1,
            type_id: 2,
            region_id,
            system_id: 3,
            location_id,
            price: 1.5,
            volume_remain: 4,
            volume_total: 5,
            min_volume: 1,
            duration: 90,
            issued: 1_700_000_000,
            range: 0,
            is_buy_order: false,
        }
    }

    #[test]
    fn range_codes_match_the_known_set() {
        assert_eq!(range_str_to_code("station").unwrap(), -2);
        assert_eq!(range_str_to_code("solarsystem").unwrap(), -1);
        assert_eq!(range_str_to_code("region").unwrap(), 0);
        assert_eq!(range_str_to_code("40").unwrap(), 40);
        assert!(range_str_to_code("7").is_err());
        assert!(range_str_to_code("garbage").is_err());
    }

    #[test]
    fn parses_a_page_of_orders() {
        let body = r#"[{
            "duration": 90,
            "is_buy_order": false,
            "issued": "2023-01-01T00:00:00Z",
            "location_id": 60003760,
            "min_volume": 1,
            "order_id": 42,
            "price": 5.5,
            "range": "region",
            "system_id": 30000142,
            "type_id": 34,
            "volume_remain": 100,
            "volume_total": 200
        }]"#;
        let orders = parse_page(body, 10000002).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, 42);
        assert_eq!(orders[0].region_id, 10000002);
        assert_eq!(orders[0].range, 0);
    }

    #[test]
    fn distinct_ids_preserve_first_appearance_order() {
        let orders = vec![
            sample_order(1, 100),
            sample_order(1, 200),
            sample_order(1, 100),
            sample_order(1, 300),
        ];
        assert_eq!(distinct_location_ids(&orders), vec![100, 200, 300]);
    }

    #[test]
    fn distinct_markets_dedup_by_region_and_type() {
        let orders = vec![sample_order(1, 1), sample_order(1, 2), sample_order(2, 1)];
        let markets = distinct_markets(&orders);
        assert_eq!(markets, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn order_round_trips_through_a_dump() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders-test.dump");
        let registry = crate::dump::DumpRegistry::new();
        let order = sample_order(1, 2);

        let mut writer = DumpWriter::open(&registry, &path, DumpType::Orders, 0).unwrap();
        write_order_table(&mut writer, &[order.clone()]).unwrap();
        writer.close().unwrap();

        let mut reader = DumpReader::open(&path).unwrap();
        let count = reader.read_u64().unwrap();
        assert_eq!(count, 1);
        let read_back = read_order(&mut reader).unwrap();
        assert_eq!(read_back, order);
    }

    #[test]
    fn empty_sweep_encodes_zero_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders-empty.dump");
        let registry = crate::dump::DumpRegistry::new();
        let mut writer = DumpWriter::open(&registry, &path, DumpType::Orders, 300).unwrap();
        write_order_table(&mut writer, &[]).unwrap();
        writer.close().unwrap();

        let mut reader = DumpReader::open(&path).unwrap();
        assert_eq!(reader.read_u64().unwrap(), 0);
    }
}
