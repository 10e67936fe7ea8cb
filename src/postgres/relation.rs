//! In-memory catalogue of table schemas discovered from `Relation` frames.

use std::collections::HashMap;

use super::codec::{self, PgValue};
use super::decoder::{Relation, TupleCell, TupleData};
use crate::{Error, Result};

/// Mapping from relation id to the most recent schema descriptor.
///
/// Mutated only by the session loop. A re-emitted `Relation` frame for a
/// known id replaces the older descriptor (schema evolution).
#[derive(Debug, Default)]
pub struct RelationSet {
    relations: HashMap<u32, Relation>,
}

impl RelationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, relation: Relation) {
        self.relations.insert(relation.id, relation);
    }

    /// Resolves a relation id to its `(schema, table)` names.
    pub fn assist(&self, id: u32) -> Result<(&str, &str)> {
        self.relations
            .get(&id)
            .map(|r| (r.namespace.as_str(), r.name.as_str()))
            .ok_or(Error::UnknownRelation(id))
    }

    /// Zips a tuple's cells with the stored column descriptors into a map of
    /// typed values.
    ///
    /// Null cells map to an explicit `PgValue::Null`; unchanged-TOAST cells
    /// are omitted, since their value was not transmitted.
    pub fn values(&self, id: u32, tuple: &TupleData) -> Result<HashMap<String, PgValue>> {
        let relation = self.relations.get(&id).ok_or(Error::UnknownRelation(id))?;
        if tuple.cells.len() != relation.columns.len() {
            return Err(Error::ArityMismatch {
                expected: relation.columns.len(),
                actual: tuple.cells.len(),
            });
        }

        let mut values = HashMap::with_capacity(tuple.cells.len());
        for (column, cell) in relation.columns.iter().zip(&tuple.cells) {
            if matches!(cell, TupleCell::UnchangedToast) {
                continue;
            }
            values.insert(column.name.clone(), codec::decode(column.type_oid, cell)?);
        }
        Ok(values)
    }
}
