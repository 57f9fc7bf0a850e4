//! Cluster schema bootstrap
//!
//! The `spec` table holds a single row of cluster configuration (row
//! width, time unit, legacy flag), read once at startup. An absent row
//! means a legacy-compatible cluster: the defaults are written back so
//! later nodes agree. Missing newer tables degrade features instead of
//! failing startup.

use super::{ColumnStore, Consistency, Mutation, ScanRequest, Table};
use crate::rowkey::RowSpec;
use crate::{Result, StratumError};
use bytes::Bytes;
use tracing::{info, warn};

const SPEC_ROW: &[u8] = b"spec";

/// What the backing store turned out to support
#[derive(Debug, Clone, Copy)]
pub struct ClusterSchema {
    /// The cluster's row layout
    pub spec: RowSpec,
    /// False when the store predates `tag_indexed_row_keys`; the lookup
    /// selector then forces the flat strategy
    pub tag_index_available: bool,
}

/// Read the cluster spec row, writing the given defaults back when no
/// row exists yet, and probe optional-table capabilities.
pub async fn load_or_init<S: ColumnStore>(
    store: &S,
    defaults: RowSpec,
    write_consistency: Consistency,
) -> Result<ClusterSchema> {
    let spec = if store.has_table(Table::Spec) {
        let request = ScanRequest::full(Table::Spec, Bytes::from_static(SPEC_ROW));
        let rows = store.scan(&request, Consistency::Quorum, 0).await?;
        match rows.first() {
            Some(entry) => {
                let spec: RowSpec = serde_json::from_slice(&entry.value)
                    .map_err(|e| StratumError::Schema(format!("unreadable spec row: {e}")))?;
                info!(
                    row_width = spec.row_width,
                    legacy = spec.legacy,
                    "loaded cluster spec"
                );
                spec
            }
            None => {
                let payload = serde_json::to_vec(&defaults)
                    .map_err(|e| StratumError::Schema(format!("unwritable spec row: {e}")))?;
                let mutation = Mutation {
                    table: Table::Spec,
                    partition: Bytes::from_static(SPEC_ROW),
                    column: Bytes::from_static(SPEC_ROW),
                    value: Bytes::from(payload),
                    ttl: None,
                };
                store.apply(&[mutation], write_consistency, 0).await?;
                info!(
                    row_width = defaults.row_width,
                    legacy = defaults.legacy,
                    "no cluster spec row; wrote defaults"
                );
                defaults
            }
        }
    } else {
        warn!("store has no spec table; running with in-process defaults");
        defaults
    };

    let tag_index_available = store.has_table(Table::TagIndexedRowKeys);
    if !tag_index_available {
        warn!("store has no tag_indexed_row_keys table; falling back to flat row-key lookups");
    }

    Ok(ClusterSchema {
        spec,
        tag_index_available,
    })
}
