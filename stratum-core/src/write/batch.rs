//! Per-submission batch builder
//!
//! Builders are call-stack local and never shared across workers; the
//! grouped sub-batches are only merged into store requests at
//! submission time. Point mutations are grouped by destination replica
//! so one partition's mutations stay co-located.

use crate::rowkey::RowKey;
use crate::store::{Mutation, ReplicaId};
use std::collections::HashMap;

/// Pending mutations for one submission
#[derive(Default)]
pub struct BatchBuilder {
    point_mutations: HashMap<ReplicaId, Vec<Mutation>>,
    row_key_mutations: Vec<Mutation>,
    string_mutations: Vec<Mutation>,
    // Cache entries to roll back if their index sub-batch fails
    pending_row_keys: Vec<RowKey>,
    pending_strings: Vec<String>,
    point_count: usize,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, replica: ReplicaId, mutation: Mutation) {
        self.point_mutations.entry(replica).or_default().push(mutation);
        self.point_count += 1;
    }

    pub fn add_row_key(&mut self, key: RowKey, mutations: Vec<Mutation>) {
        self.row_key_mutations.extend(mutations);
        self.pending_row_keys.push(key);
    }

    pub fn add_string(&mut self, name: String, mutation: Mutation) {
        self.string_mutations.push(mutation);
        self.pending_strings.push(name);
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    pub fn row_key_count(&self) -> usize {
        self.pending_row_keys.len()
    }

    pub fn string_count(&self) -> usize {
        self.pending_strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_count == 0 && self.row_key_mutations.is_empty() && self.string_mutations.is_empty()
    }

    /// Tear the batch into its sub-batches for submission
    pub fn into_parts(self) -> BatchParts {
        BatchParts {
            point_mutations: self.point_mutations,
            row_key_mutations: self.row_key_mutations,
            string_mutations: self.string_mutations,
            pending_row_keys: self.pending_row_keys,
            pending_strings: self.pending_strings,
        }
    }
}

pub struct BatchParts {
    pub point_mutations: HashMap<ReplicaId, Vec<Mutation>>,
    pub row_key_mutations: Vec<Mutation>,
    pub string_mutations: Vec<Mutation>,
    pub pending_row_keys: Vec<RowKey>,
    pub pending_strings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Table;
    use crate::Tags;
    use bytes::Bytes;

    fn mutation() -> Mutation {
        Mutation {
            table: Table::DataPoints,
            partition: Bytes::from_static(b"p"),
            column: Bytes::from_static(b"c"),
            value: Bytes::new(),
            ttl: None,
        }
    }

    #[test]
    fn test_groups_points_by_replica() {
        let mut batch = BatchBuilder::new();
        batch.add_point(0, mutation());
        batch.add_point(1, mutation());
        batch.add_point(0, mutation());
        batch.add_row_key(RowKey::legacy("m", 0, Tags::new()), vec![mutation()]);

        assert_eq!(batch.point_count(), 3);
        assert_eq!(batch.row_key_count(), 1);
        assert!(!batch.is_empty());

        let parts = batch.into_parts();
        assert_eq!(parts.point_mutations[&0].len(), 2);
        assert_eq!(parts.point_mutations[&1].len(), 1);
        assert_eq!(parts.row_key_mutations.len(), 1);
    }
}
