//! Redis-backed availability cache
//!
//! Layout:
//! - `{prefix}:technician:{id}` hash with `id, name, latitude, longitude, available, order_id`
//! - `{prefix}:technicians` set of known ids
//!
//! Reserve and release run as Lua scripts so the check-and-set happens server side.

use crate::domain::error::StoreError;
use crate::domain::types::{Coordinate, OrderId, TechnicianId, TechnicianRecord};
use crate::services::availability::{AvailabilityCache, ReserveOutcome, SyncOutcome};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use tracing::{info, warn};

/// 1 reserved, 0 busy (returns current order in the second slot), -1 unknown
const RESERVE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-1, ''}
end
if redis.call('HGET', KEYS[1], 'available') == '1' then
  redis.call('HSET', KEYS[1], 'available', '0', 'order_id', ARGV[1])
  return {1, ''}
end
return {0, redis.call('HGET', KEYS[1], 'order_id') or ''}
"#;

/// 1 released, 0 unknown
const RELEASE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'available', '1', 'order_id', '')
return 1
"#;

/// 1 released, 0 not held by ARGV[1] (unknown, available, or another order)
const RELEASE_IF_HELD_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'order_id') == ARGV[1] then
  redis.call('HSET', KEYS[1], 'available', '1', 'order_id', '')
  return 1
end
return 0
"#;

/// Insert-or-refresh: profile fields always written, state fields only when absent
const SYNC_SCRIPT: &str = r#"
local existed = redis.call('EXISTS', KEYS[1])
redis.call('HSET', KEYS[1], 'id', ARGV[1], 'name', ARGV[2], 'latitude', ARGV[3], 'longitude', ARGV[4])
redis.call('HSETNX', KEYS[1], 'available', '1')
redis.call('HSETNX', KEYS[1], 'order_id', '')
redis.call('SADD', KEYS[2], ARGV[1])
return existed
"#;

fn unreachable(e: redis::RedisError) -> StoreError {
    StoreError::Unreachable(e.to_string())
}

/// Rebuild a record from its hash fields
pub(crate) fn record_from_hash(
    id: &str,
    fields: &HashMap<String, String>,
) -> Result<TechnicianRecord, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt { id: id.to_string(), reason: reason.to_string() };

    let parse = |name: &str| -> Result<f64, StoreError> {
        fields
            .get(name)
            .ok_or_else(|| corrupt(&format!("missing {name}")))?
            .parse::<f64>()
            .map_err(|_| corrupt(&format!("unparsable {name}")))
    };
    let coordinate = Coordinate::new(parse("latitude")?, parse("longitude")?)
        .map_err(|e| corrupt(&e.to_string()))?;

    let is_available = match fields.get("available").map(String::as_str) {
        Some("1") => true,
        Some("0") => false,
        _ => return Err(corrupt("bad available flag")),
    };
    let current_order_id =
        fields.get("order_id").filter(|o| !o.is_empty()).map(|o| OrderId::new(o.as_str()));
    let name = fields.get("name").filter(|n| !n.is_empty()).cloned();

    TechnicianRecord::from_parts(TechnicianId::from(id), name, coordinate, is_available, current_order_id)
        .map_err(|e| corrupt(&e.to_string()))
}

pub struct RedisAvailabilityCache {
    conn: ConnectionManager,
    prefix: String,
    reserve: Script,
    release: Script,
    release_if_held: Script,
    sync: Script,
}

impl RedisAvailabilityCache {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(unreachable)?;
        let mut conn = client.get_connection_manager().await.map_err(unreachable)?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(unreachable)?;
        info!(prefix = %prefix, "redis_availability_cache_connected");

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            reserve: Script::new(RESERVE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            release_if_held: Script::new(RELEASE_IF_HELD_SCRIPT),
            sync: Script::new(SYNC_SCRIPT),
        })
    }

    fn technician_key(&self, id: &str) -> String {
        format!("{}:technician:{}", self.prefix, id)
    }

    fn roster_key(&self) -> String {
        format!("{}:technicians", self.prefix)
    }
}

#[async_trait]
impl AvailabilityCache for RedisAvailabilityCache {
    async fn get(&self, id: &TechnicianId) -> Result<Option<TechnicianRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.technician_key(id.as_str()))
            .query_async(&mut conn)
            .await
            .map_err(unreachable)?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_hash(id.as_str(), &fields).map(Some)
    }

    async fn list(&self) -> Result<Vec<TechnicianRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.roster_key())
            .query_async(&mut conn)
            .await
            .map_err(unreachable)?;
        ids.sort();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HGETALL").arg(self.technician_key(id));
        }
        let hashes: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(unreachable)?;

        let mut records = Vec::with_capacity(ids.len());
        for (id, fields) in ids.iter().zip(hashes) {
            if fields.is_empty() {
                continue;
            }
            match record_from_hash(id, &fields) {
                Ok(record) => records.push(record),
                Err(e) => warn!(technician_id = %id, error = %e, "technician_record_skipped"),
            }
        }
        Ok(records)
    }

    async fn sync(&self, record: &TechnicianRecord) -> Result<SyncOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let existed: i64 = self
            .sync
            .key(self.technician_key(record.id().as_str()))
            .key(self.roster_key())
            .arg(record.id().as_str())
            .arg(record.name().unwrap_or(""))
            .arg(record.coordinate().latitude().to_string())
            .arg(record.coordinate().longitude().to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(unreachable)?;

        Ok(if existed == 0 { SyncOutcome::Inserted } else { SyncOutcome::Refreshed })
    }

    async fn compare_and_reserve(
        &self,
        id: &TechnicianId,
        order_id: &OrderId,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (code, current): (i64, String) = self
            .reserve
            .key(self.technician_key(id.as_str()))
            .arg(order_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unreachable)?;

        Ok(match code {
            1 => ReserveOutcome::Reserved,
            0 => ReserveOutcome::Busy((!current.is_empty()).then(|| OrderId::new(current))),
            _ => ReserveOutcome::UnknownTechnician,
        })
    }

    async fn release(&self, id: &TechnicianId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.technician_key(id.as_str()))
            .invoke_async(&mut conn)
            .await
            .map_err(unreachable)?;
        Ok(released == 1)
    }

    async fn release_if_held(&self, id: &TechnicianId, order_id: &OrderId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_if_held
            .key(self.technician_key(id.as_str()))
            .arg(order_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unreachable)?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::HasAvailability;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_record_from_hash() {
        let record = record_from_hash(
            "t1",
            &fields(&[
                ("id", "t1"),
                ("name", "Ion"),
                ("latitude", "47.02"),
                ("longitude", "28.83"),
                ("available", "0"),
                ("order_id", "o7"),
            ]),
        )
        .unwrap();
        assert_eq!(record.name(), Some("Ion"));
        assert!(!record.is_available());
        assert_eq!(record.current_order_id(), Some(&OrderId::from("o7")));
    }

    #[test]
    fn test_record_from_hash_rejects_corrupt() {
        let missing_lat = fields(&[("longitude", "28.8"), ("available", "1")]);
        assert!(matches!(record_from_hash("t1", &missing_lat), Err(StoreError::Corrupt { .. })));

        let busy_without_order =
            fields(&[("latitude", "47.0"), ("longitude", "28.8"), ("available", "0"), ("order_id", "")]);
        assert!(record_from_hash("t1", &busy_without_order).is_err());
    }

    /// Needs a local Redis: `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_redis_reserve_race() {
        let prefix = format!("dispatch-test-{}", uuid::Uuid::now_v7());
        let cache = std::sync::Arc::new(
            RedisAvailabilityCache::connect("redis://127.0.0.1:6379", &prefix).await.unwrap(),
        );
        let tech = TechnicianRecord::available(
            TechnicianId::from("t1"),
            Coordinate::new(47.0, 28.8).unwrap(),
        );
        assert_eq!(cache.sync(&tech).await.unwrap(), SyncOutcome::Inserted);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = std::sync::Arc::clone(&cache);
                tokio::spawn(async move {
                    cache
                        .compare_and_reserve(&TechnicianId::from("t1"), &OrderId::new(format!("o{i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() == ReserveOutcome::Reserved {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        // Resync must not clear the reservation
        assert_eq!(cache.sync(&tech).await.unwrap(), SyncOutcome::Refreshed);
        assert!(!cache.get(&TechnicianId::from("t1")).await.unwrap().unwrap().is_available());

        let winner = cache.get(&TechnicianId::from("t1")).await.unwrap().unwrap();
        let winner_order = winner.current_order_id().cloned().unwrap();
        assert!(!cache.release_if_held(&TechnicianId::from("t1"), &OrderId::from("nobody")).await.unwrap());
        assert!(cache.release_if_held(&TechnicianId::from("t1"), &winner_order).await.unwrap());

        assert!(cache.release(&TechnicianId::from("t1")).await.unwrap());
        assert!(!cache.release(&TechnicianId::from("ghost")).await.unwrap());
    }
}
