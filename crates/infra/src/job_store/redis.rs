//! Redis-backed job store.
//!
//! Layout (with the default `gas` namespace):
//! - `gas:job:<job_id>`: JSON-encoded [`JobRecord`]
//! - `gas:user_jobs:<user_id>`: set of job ids
//! - `gas:lease:<job_id>`: lease owner, with a PX expiry
//!
//! Mutations run as WATCH/MULTI/EXEC optimistic transactions: the record is
//! read under WATCH, the transition is applied in Rust, and the write only
//! commits if the key was not modified concurrently (otherwise it retries).

use std::sync::Arc;
use std::time::Duration;

use redis::Commands;
use tracing::debug;

use gas_core::{JobId, JobRecord, UserId};

use super::{JobStore, JobStoreError, Mutation};

const DEFAULT_NAMESPACE: &str = "gas";

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    namespace: String,
}

fn storage(err: redis::RedisError) -> JobStoreError {
    JobStoreError::Storage(err.to_string())
}

impl RedisJobStore {
    pub fn new(redis_url: impl AsRef<str>, namespace: Option<String>) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(storage)?;
        Ok(Self::from_client(Arc::new(client), namespace))
    }

    pub fn from_client(client: Arc<redis::Client>, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace: namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        }
    }

    fn connection(&self) -> Result<redis::Connection, JobStoreError> {
        self.client.get_connection().map_err(storage)
    }

    fn job_key(&self, job_id: JobId) -> String {
        format!("{}:job:{job_id}", self.namespace)
    }

    fn user_key(&self, user_id: &UserId) -> String {
        format!("{}:user_jobs:{user_id}", self.namespace)
    }

    fn lease_key(&self, job_id: JobId) -> String {
        format!("{}:lease:{job_id}", self.namespace)
    }
}

fn encode(record: &JobRecord) -> Result<String, JobStoreError> {
    serde_json::to_string(record).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

fn decode(raw: &str) -> Result<JobRecord, JobStoreError> {
    serde_json::from_str(raw).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

impl JobStore for RedisJobStore {
    fn create(&self, record: JobRecord) -> Result<(), JobStoreError> {
        let mut conn = self.connection()?;
        let payload = encode(&record)?;

        let created: Option<String> = redis::cmd("SET")
            .arg(self.job_key(record.job_id))
            .arg(&payload)
            .arg("NX")
            .query(&mut conn)
            .map_err(storage)?;
        if created.is_none() {
            return Err(JobStoreError::AlreadyExists(record.job_id));
        }

        let _: i64 = conn
            .sadd(self.user_key(&record.user_id), record.job_id.to_string())
            .map_err(storage)?;
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = conn.get(self.job_key(job_id)).map_err(storage)?;
        raw.as_deref().map(decode).transpose()
    }

    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut conn = self.connection()?;
        let ids: Vec<String> = conn.smembers(self.user_key(user_id)).map_err(storage)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| format!("{}:job:{id}", self.namespace)).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query(&mut conn).map_err(storage)?;

        let mut out = raws
            .into_iter()
            .flatten()
            .map(|raw| decode(&raw))
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|j| (j.submit_time, j.job_id));
        Ok(out)
    }

    fn apply(&self, job_id: JobId, mutation: Mutation) -> Result<JobRecord, JobStoreError> {
        let mut conn = self.connection()?;
        let key = self.job_key(job_id);

        // The closure yields Ok(Some(..)) to finish, Ok(None) to retry after a
        // concurrent write. Domain outcomes travel inside the inner Result.
        let outcome: Result<JobRecord, JobStoreError> =
            redis::transaction(&mut conn, &[&key], |conn, pipe| {
                let raw: Option<String> = conn.get(&key)?;
                let Some(raw) = raw else {
                    return Ok(Some(Err(JobStoreError::NotFound(job_id))));
                };
                let mut record = match decode(&raw) {
                    Ok(record) => record,
                    Err(err) => return Ok(Some(Err(err))),
                };
                if let Err(err) = mutation.clone().apply(&mut record) {
                    return Ok(Some(Err(err)));
                }
                let payload = match encode(&record) {
                    Ok(payload) => payload,
                    Err(err) => return Ok(Some(Err(err))),
                };

                let committed: Option<()> = pipe.set(&key, payload).ignore().query(conn)?;
                if committed.is_none() {
                    debug!(job_id = %job_id, "job record changed during transaction; retrying");
                }
                Ok(committed.map(|_| Ok(record)))
            })
            .map_err(storage)?;

        outcome
    }

    fn acquire_lease(&self, job_id: JobId, owner: &str, ttl: Duration) -> Result<bool, JobStoreError> {
        let mut conn = self.connection()?;
        let key = self.lease_key(job_id);
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query(&mut conn)
            .map_err(storage)?;
        if acquired.is_some() {
            return Ok(true);
        }

        // Re-entrant for the current holder.
        let holder: Option<String> = conn.get(&key).map_err(storage)?;
        if holder.as_deref() == Some(owner) {
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl_ms)
                .query(&mut conn)
                .map_err(storage)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn release_lease(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::Script::new(RELEASE_LEASE_SCRIPT)
            .key(self.lease_key(job_id))
            .arg(owner)
            .invoke(&mut conn)
            .map_err(storage)?;
        Ok(())
    }
}
