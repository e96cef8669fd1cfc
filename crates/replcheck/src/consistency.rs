//! Cross-replica data comparison for a fixed set of written records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use tokio::time;
use tracing::{info, warn};

use crate::config::{Endpoint, ReplicaId};
use crate::datastore::{Connection, Connector, Record, RecordId};
use crate::error::{VerifyError, VerifyResult};
use crate::fanout::map_replicas;

/// Comparison of one replica against the primary.
#[derive(Clone, Debug, Serialize)]
pub struct ConsistencyReport {
    pub replica: ReplicaId,
    pub label: String,
    pub expected_rows: usize,
    pub observed_rows: usize,
    pub count_mismatch: bool,
    /// Requested rows that are missing or differ in payload or tag.
    pub mismatched_records: usize,
    pub error: Option<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.error.is_none() && !self.count_mismatch && self.mismatched_records == 0
    }
}

/// Counts rows of `expected` that are absent from `observed` or differ.
///
/// Rows in `observed` that `expected` does not contain are ignored.
pub fn compare_records(expected: &[Record], observed: &[Record]) -> usize {
    let observed = observed
        .iter()
        .map(|record| (record.id, record))
        .collect::<HashMap<_, _>>();
    expected
        .iter()
        .filter(|want| {
            observed
                .get(&want.id)
                .map_or(true, |got| !want.same_content(got))
        })
        .count()
}

/// Compares the first `sample` of `ids` between the primary and every replica.
///
/// A primary fetch failure fails the phase; replica failures are recorded in
/// that replica's report. Every fetch is bounded by `op_timeout`.
pub async fn check_consistency<C>(
    connector: &Arc<C>,
    primary: &mut C::Conn,
    primary_label: &str,
    replicas: &[Endpoint],
    ids: &[RecordId],
    sample: usize,
    op_timeout: Duration,
) -> VerifyResult<Vec<ConsistencyReport>>
where
    C: Connector,
{
    let wanted = ids.iter().take(sample).copied().collect::<Vec<_>>();
    let expected = time::timeout(op_timeout, primary.fetch_records(&wanted))
        .await
        .unwrap_or_else(|_| Err(anyhow!("row fetch timed out after {op_timeout:?}")))
        .map_err(|cause| VerifyError::Query {
            endpoint: primary_label.to_string(),
            cause,
        })?;
    info!(
        requested = wanted.len(),
        rows = expected.len(),
        "comparing rows across replicas"
    );

    // The replicas are asked for the rows the primary actually returned.
    let expected = Arc::new(expected);
    let requested = Arc::new(expected.iter().map(|r| r.id).collect::<Vec<_>>());

    let results = map_replicas(replicas.to_vec(), replicas.len(), |replica, endpoint| {
        let connector = connector.clone();
        let expected = expected.clone();
        let requested = requested.clone();
        async move {
            let fetch = fetch_replica(connector.as_ref(), &endpoint, &requested);
            let fetched = time::timeout(op_timeout, fetch)
                .await
                .unwrap_or_else(|_| Err(anyhow!("row fetch timed out after {op_timeout:?}")));
            compare_replica(replica, endpoint, &expected, fetched)
        }
    })
    .await;

    let reports = results
        .into_iter()
        .enumerate()
        .map(|(idx, result)| {
            result.unwrap_or_else(|err| ConsistencyReport {
                replica: ReplicaId(idx),
                label: replicas[idx].label(),
                expected_rows: expected.len(),
                observed_rows: 0,
                count_mismatch: true,
                mismatched_records: expected.len(),
                error: Some(err.to_string()),
            })
        })
        .collect::<Vec<_>>();

    for report in &reports {
        if report.is_consistent() {
            info!(replica = %report.label, rows = report.observed_rows, "replica consistent");
        } else {
            warn!(
                replica = %report.label,
                expected = report.expected_rows,
                observed = report.observed_rows,
                mismatched = report.mismatched_records,
                error = ?report.error,
                "replica inconsistent"
            );
        }
    }
    Ok(reports)
}

async fn fetch_replica<C>(
    connector: &C,
    endpoint: &Endpoint,
    requested: &[RecordId],
) -> anyhow::Result<Vec<Record>>
where
    C: Connector,
{
    match connector.connect(endpoint).await {
        Ok(mut conn) => conn.fetch_records(requested).await,
        Err(err) => Err(err.context("connect failed")),
    }
}

fn compare_replica(
    replica: ReplicaId,
    endpoint: Endpoint,
    expected: &[Record],
    fetched: anyhow::Result<Vec<Record>>,
) -> ConsistencyReport {
    let mut report = ConsistencyReport {
        replica,
        label: endpoint.label(),
        expected_rows: expected.len(),
        observed_rows: 0,
        count_mismatch: false,
        mismatched_records: 0,
        error: None,
    };

    match fetched {
        Ok(observed) => {
            report.observed_rows = observed.len();
            report.count_mismatch = observed.len() != expected.len();
            report.mismatched_records = compare_records(expected, &observed);
        }
        Err(err) => {
            report.count_mismatch = true;
            report.mismatched_records = expected.len();
            report.error = Some(format!("{err:#}"));
        }
    }
    report
}
