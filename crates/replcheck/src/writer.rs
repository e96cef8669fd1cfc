//! Bulk write phase on the primary.

use std::collections::HashSet;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::datastore::{Connection, NewRecord, RecordId};
use crate::error::{VerifyError, VerifyResult};

const PAYLOAD_LEN: usize = 50;
const MAX_TAG: i32 = 1_000_000;

/// Result of the write phase.
#[derive(Clone, Debug, Serialize)]
pub struct WriteOutcome {
    /// Identifiers assigned by the primary, in insertion order.
    #[serde(skip)]
    pub ids: Vec<RecordId>,
    pub rows: usize,
    #[serde(serialize_with = "crate::report::duration_ms")]
    pub elapsed: Duration,
}

impl WriteOutcome {
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows as f64 / secs
        } else {
            0.0
        }
    }
}

/// Generates `count` rows with random alphanumeric payloads and random tags.
pub fn generate_records<R: Rng>(rng: &mut R, count: usize) -> Vec<NewRecord> {
    (0..count)
        .map(|_| NewRecord {
            payload: (&mut *rng)
                .sample_iter(&Alphanumeric)
                .take(PAYLOAD_LEN)
                .map(char::from)
                .collect(),
            tag: rng.gen_range(1..=MAX_TAG),
        })
        .collect()
}

/// Inserts `records` on the primary in one transaction.
///
/// All-or-nothing: any failure is reported as [`VerifyError::Write`] and the
/// primary keeps none of the rows.
pub async fn inject_writes<C>(primary: &mut C, records: &[NewRecord]) -> VerifyResult<WriteOutcome>
where
    C: Connection + ?Sized,
{
    info!(rows = records.len(), "writing records to primary");
    let started = Instant::now();
    let ids = primary
        .insert_batch(records)
        .await
        .map_err(VerifyError::Write)?;
    let elapsed = started.elapsed();

    if ids.len() != records.len() {
        return Err(VerifyError::Write(anyhow::anyhow!(
            "primary returned {} identifiers for {} rows",
            ids.len(),
            records.len()
        )));
    }
    let distinct = ids.iter().collect::<HashSet<_>>().len();
    if distinct != ids.len() {
        return Err(VerifyError::Write(anyhow::anyhow!(
            "primary returned {} duplicate identifiers",
            ids.len() - distinct
        )));
    }

    let outcome = WriteOutcome {
        rows: ids.len(),
        ids,
        elapsed,
    };
    info!(
        rows = outcome.rows,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        rows_per_sec = outcome.rows_per_sec(),
        "write phase complete"
    );
    Ok(outcome)
}
