//! `heed`-backed [`EnvelopeStore`] (spec §6). Keys are
//! `"{serial_number}#{subkey}"` ASCII strings, matching
//! `original_source/src/ProtectionDB.C`'s `putField`/`getField` convention
//! exactly, so an existing protection database from the original driver
//! remains byte-compatible if ever imported. Unlike the original's
//! per-field `MDB_val` layout, this driver serializes one
//! [`EnvelopeRecord`] per FPU as a single JSON value under the `"record"`
//! subkey — the fine-grained per-field keys bought the original nothing
//! that a typed Rust struct doesn't already give for free, and every
//! access here already crosses an LMDB transaction boundary.

use std::path::Path;

use async_trait::async_trait;
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use crate::protection::{EnvelopeRecord, EnvelopeStore, FpuCounters};

const SUBKEY: &str = "record";

/// Field names mirror spec §6's persistence keys (`aretries`,
/// `alpha_retry_count_cw`, `alpha_retry_count_acw`, `bretries`,
/// `beta_retry_count_cw`, `beta_retry_count_acw`), the same keys
/// `original_source/src/ProtectionDB.C` defines as `free_alpha_retries_keystr`
/// et al. — `aretries`/`bretries` there name the per-FPU maxima, not a count.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    alpha_min: i32,
    alpha_max: i32,
    beta_min: i32,
    beta_max: i32,
    counters: [i64; crate::protection::NUM_COUNTERS],
    locked_until_datum: bool,
    aretries: u32,
    alpha_retry_count_cw: u32,
    alpha_retry_count_acw: u32,
    bretries: u32,
    beta_retry_count_cw: u32,
    beta_retry_count_acw: u32,
}

impl From<&EnvelopeRecord> for StoredRecord {
    fn from(r: &EnvelopeRecord) -> Self {
        Self {
            alpha_min: r.envelope.alpha_min,
            alpha_max: r.envelope.alpha_max,
            beta_min: r.envelope.beta_min,
            beta_max: r.envelope.beta_max,
            counters: r.counters.values,
            locked_until_datum: r.locked_until_datum,
            aretries: r.max_alpha_retries,
            alpha_retry_count_cw: r.alpha_retry_count_cw,
            alpha_retry_count_acw: r.alpha_retry_count_acw,
            bretries: r.max_beta_retries,
            beta_retry_count_cw: r.beta_retry_count_cw,
            beta_retry_count_acw: r.beta_retry_count_acw,
        }
    }
}

impl From<StoredRecord> for EnvelopeRecord {
    fn from(s: StoredRecord) -> Self {
        Self {
            envelope: crate::protection::Envelope {
                alpha_min: s.alpha_min,
                alpha_max: s.alpha_max,
                beta_min: s.beta_min,
                beta_max: s.beta_max,
            },
            counters: FpuCounters { values: s.counters },
            locked_until_datum: s.locked_until_datum,
            max_alpha_retries: s.aretries,
            alpha_retry_count_cw: s.alpha_retry_count_cw,
            alpha_retry_count_acw: s.alpha_retry_count_acw,
            max_beta_retries: s.bretries,
            beta_retry_count_cw: s.beta_retry_count_cw,
            beta_retry_count_acw: s.beta_retry_count_acw,
        }
    }
}

pub struct LmdbEnvelopeStore {
    env: Env,
    db: Database<Str, SerdeJson<StoredRecord>>,
}

impl LmdbEnvelopeStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(path)?;
        // SAFETY: `path` is a directory this process controls exclusively
        // for the lifetime of the environment (guarded at a higher level by
        // `DeviceLock`), satisfying heed's single-writer-process contract.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(64 * 1024 * 1024)
                .max_dbs(1)
                .open(path)?
        };
        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some("fpu_envelopes"))?;
        wtxn.commit()?;
        Ok(Self { env, db })
    }

    fn key(serial_number: &str) -> String {
        format!("{serial_number}#{SUBKEY}")
    }
}

#[async_trait]
impl EnvelopeStore for LmdbEnvelopeStore {
    async fn load(&self, serial_number: &str) -> anyhow::Result<Option<EnvelopeRecord>> {
        let rtxn = self.env.read_txn()?;
        let key = Self::key(serial_number);
        let stored = self.db.get(&rtxn, &key)?;
        Ok(stored.map(EnvelopeRecord::from))
    }

    async fn store(&self, serial_number: &str, record: &EnvelopeRecord) -> anyhow::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let key = Self::key(serial_number);
        self.db.put(&mut wtxn, &key, &StoredRecord::from(record))?;
        wtxn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_through_a_fresh_environment() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbEnvelopeStore::open(dir.path()).unwrap();
        assert!(store.load("SN001").await.unwrap().is_none());

        let mut record = EnvelopeRecord::default();
        record.envelope = record.envelope.widened(120, 40);
        record.counters.increment(crate::protection::CounterId::Collisions, 3);
        store.store("SN001", &record).await.unwrap();

        let loaded = store.load("SN001").await.unwrap().unwrap();
        assert_eq!(loaded.envelope, record.envelope);
        assert_eq!(loaded.counters.get(crate::protection::CounterId::Collisions), 3);
    }

    #[tokio::test]
    async fn distinct_serial_numbers_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbEnvelopeStore::open(dir.path()).unwrap();
        let mut a = EnvelopeRecord::default();
        a.envelope = a.envelope.widened(10, 10);
        store.store("SN-A", &a).await.unwrap();
        assert!(store.load("SN-B").await.unwrap().is_none());
    }
}
