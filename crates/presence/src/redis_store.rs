//! Redis-Backend fuer den Presence-Store
//!
//! Presence ueberlebt damit Neustarts und wird von mehreren Instanzen
//! geteilt. Ein `atomar`-Block laeuft als ein einziger Lua-Aufruf; Redis
//! fuehrt Skripte unteilbar aus, auch die bedingten Operationen
//! (`VerwaisteFelderEntfernen`, `SetEntfernenFallsLeer`), die MULTI/EXEC
//! nicht ausdruecken kann.
//!
//! Die Verbindung wird beim ersten Zugriff aufgebaut. Ist Redis beim Start
//! nicht erreichbar, laeuft der Server mit degradierter Presence weiter und
//! verbindet sich beim naechsten Zugriff neu.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{PresenceError, PresenceResult};
use crate::store::{PresenceStore, StoreOp, StoreWert};

/// Fuehrt eine JSON-kodierte Liste von Operationen aus (`ARGV[1]`)
///
/// Rueckgabe pro Operation eine Zahl; `-1` steht fuer `StoreWert::Ok`.
const BLOCK_SKRIPT: &str = r#"
local ops = cjson.decode(ARGV[1])
local erg = {}
local function laenge(key)
  local typ = redis.call('TYPE', key).ok
  if typ == 'hash' then return redis.call('HLEN', key) end
  if typ == 'set' then return redis.call('SCARD', key) end
  if typ == 'none' then return 0 end
  return 1
end
for i, op in ipairs(ops) do
  local t = op.op
  if t == 'hsetnx' then
    erg[i] = redis.call('HSETNX', op.key, op.feld, op.wert)
  elseif t == 'hdel' then
    erg[i] = redis.call('HDEL', op.key, op.feld)
  elseif t == 'verwaist' then
    local n = 0
    for _, f in ipairs(redis.call('HKEYS', op.key)) do
      if redis.call('EXISTS', op.praefix .. f) == 0 then
        redis.call('HDEL', op.key, f)
        n = n + 1
      end
    end
    erg[i] = n
  elseif t == 'set' then
    if op.ttl_ms then
      redis.call('SET', op.key, op.wert, 'PX', op.ttl_ms)
    else
      redis.call('SET', op.key, op.wert)
    end
    erg[i] = -1
  elseif t == 'del' then
    erg[i] = redis.call('DEL', op.key)
  elseif t == 'expire' then
    erg[i] = redis.call('PEXPIRE', op.key, op.ttl_ms)
  elseif t == 'sadd' then
    erg[i] = redis.call('SADD', op.key, op.mitglied)
  elseif t == 'srem_leer' then
    if laenge(op.pruef_key) > 0 then
      erg[i] = 0
    else
      erg[i] = redis.call('SREM', op.key, op.mitglied)
    end
  elseif t == 'hlen' then
    erg[i] = redis.call('HLEN', op.key)
  else
    return redis.error_reply('unbekannte Operation ' .. tostring(t))
  end
end
return erg
"#;

pub struct RedisStore {
    client: Client,
    verbindung: Mutex<Option<ConnectionManager>>,
    skript: Script,
}

impl RedisStore {
    /// Prueft nur die URL, baut noch keine Verbindung auf
    pub fn neu(url: &str) -> PresenceResult<Self> {
        let client = Client::open(url).map_err(store_fehler)?;
        Ok(Self {
            client,
            verbindung: Mutex::new(None),
            skript: Script::new(BLOCK_SKRIPT),
        })
    }

    async fn verbindung(&self) -> PresenceResult<ConnectionManager> {
        let mut slot = self.verbindung.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(store_fehler)?;
        tracing::info!("Verbindung zum Presence-Store (Redis) hergestellt");
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn atomar(&self, ops: Vec<StoreOp>) -> PresenceResult<Vec<StoreWert>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let anzahl = ops.len();
        let block = Value::Array(ops.iter().map(lua_op).collect()).to_string();

        let mut conn = self.verbindung().await?;
        let werte: Vec<i64> = self
            .skript
            .arg(block)
            .invoke_async(&mut conn)
            .await
            .map_err(store_fehler)?;
        if werte.len() != anzahl {
            return Err(PresenceError::store(format!(
                "{} Ergebnisse fuer {anzahl} Operationen",
                werte.len()
            )));
        }
        Ok(werte.into_iter().map(store_wert).collect())
    }

    async fn holen(&self, key: &str) -> PresenceResult<Option<String>> {
        let mut conn = self.verbindung().await?;
        let wert: Option<String> = conn.get(key).await.map_err(store_fehler)?;
        Ok(wert)
    }

    async fn hash_alle(&self, key: &str) -> PresenceResult<HashMap<String, String>> {
        let mut conn = self.verbindung().await?;
        let felder: HashMap<String, String> = conn.hgetall(key).await.map_err(store_fehler)?;
        Ok(felder)
    }

    async fn set_mitglieder(&self, key: &str) -> PresenceResult<Vec<String>> {
        let mut conn = self.verbindung().await?;
        let mut mitglieder: Vec<String> = conn.smembers(key).await.map_err(store_fehler)?;
        mitglieder.sort();
        Ok(mitglieder)
    }

    async fn ping(&self) -> PresenceResult<()> {
        let mut conn = self.verbindung().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_fehler)?;
        Ok(())
    }
}

fn store_fehler(e: RedisError) -> PresenceError {
    PresenceError::store(e.to_string())
}

fn store_wert(n: i64) -> StoreWert {
    u64::try_from(n).map_or(StoreWert::Ok, StoreWert::Zahl)
}

/// Kodiert eine Operation fuer [`BLOCK_SKRIPT`]
fn lua_op(op: &StoreOp) -> Value {
    match op {
        StoreOp::HashSetzenFallsNeu { key, feld, wert } => {
            json!({ "op": "hsetnx", "key": key, "feld": feld, "wert": wert })
        }
        StoreOp::HashEntfernen { key, feld } => json!({ "op": "hdel", "key": key, "feld": feld }),
        StoreOp::VerwaisteFelderEntfernen { key, praefix } => {
            json!({ "op": "verwaist", "key": key, "praefix": praefix })
        }
        // Ohne ttl_ms: cjson wuerde null als wahren Wert dekodieren
        StoreOp::Setzen { key, wert, ttl: None } => json!({ "op": "set", "key": key, "wert": wert }),
        StoreOp::Setzen { key, wert, ttl: Some(ttl) } => json!({
            "op": "set",
            "key": key,
            "wert": wert,
            "ttl_ms": ttl.as_millis().max(1) as u64,
        }),
        StoreOp::Loeschen { key } => json!({ "op": "del", "key": key }),
        StoreOp::Ablauf { key, ttl } => json!({
            "op": "expire",
            "key": key,
            "ttl_ms": ttl.as_millis().max(1) as u64,
        }),
        StoreOp::SetHinzufuegen { key, mitglied } => {
            json!({ "op": "sadd", "key": key, "mitglied": mitglied })
        }
        StoreOp::SetEntfernenFallsLeer { key, mitglied, pruef_key } => json!({
            "op": "srem_leer",
            "key": key,
            "mitglied": mitglied,
            "pruef_key": pruef_key,
        }),
        StoreOp::HashLaenge { key } => json!({ "op": "hlen", "key": key }),
    }
}
