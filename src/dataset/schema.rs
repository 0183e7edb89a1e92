//! Table schemas and schema legends.
//!
//! A schema is the ordered list of columns stored at `meta/schema.json`. A
//! legend is the minimal snapshot of a schema a feature blob needs in order
//! to be decoded - the primary-key column ids and the non-PK column ids, in
//! order - stored once under `meta/legend/<hash>` and referenced from every
//! feature blob by that hash. This lets feature blobs omit all field
//! metadata while surviving schema changes that don't touch the columns
//! they reference.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StrataError;
use crate::serialise::{hexhash, json_pack};

/// Column types supported by tabular datasets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Text,
    Blob,
    Geometry,
    Date,
    Time,
    Timestamp,
    Numeric,
    Interval,
}

/// One column of a table schema.
///
/// The `id` is a stable identifier that survives renames; all schema
/// comparison is done by id, never by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    pub id: String,
    pub name: String,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key_index: Option<u32>,
}

/// How two schemas differ, counted by column id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchemaDiffCounts {
    pub inserts: usize,
    pub deletes: usize,
    pub name_updates: usize,
    pub type_updates: usize,
    pub pk_updates: usize,
}

/// An ordered list of columns describing the features of one dataset
/// version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub columns: Vec<ColumnSchema>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>) -> Schema {
        Schema { columns }
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Schema, StrataError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_value(&self) -> Result<Value, StrataError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Primary-key columns, in primary-key order.
    pub fn pk_columns(&self) -> Vec<&ColumnSchema> {
        let mut pks: Vec<&ColumnSchema> = self
            .columns
            .iter()
            .filter(|c| c.primary_key_index.is_some())
            .collect();
        pks.sort_by_key(|c| c.primary_key_index);
        pks
    }

    /// Non-primary-key columns, in schema order.
    pub fn non_pk_columns(&self) -> Vec<&ColumnSchema> {
        self.columns
            .iter()
            .filter(|c| c.primary_key_index.is_none())
            .collect()
    }

    /// The legend this schema implies.
    pub fn legend(&self) -> Legend {
        Legend {
            pk_ids: self.pk_columns().iter().map(|c| c.id.clone()).collect(),
            non_pk_ids: self
                .non_pk_columns()
                .iter()
                .map(|c| c.id.clone())
                .collect(),
        }
    }

    /// Compare two schemas column-by-column (matched on id), classifying the
    /// differences. Used by the import pipeline to decide whether feature
    /// deduplication against old blobs can work at all.
    pub fn diff_type_counts(&self, other: &Schema) -> SchemaDiffCounts {
        let mut counts = SchemaDiffCounts::default();
        for old in &self.columns {
            match other.columns.iter().find(|c| c.id == old.id) {
                None => counts.deletes += 1,
                Some(new) => {
                    if old.name != new.name {
                        counts.name_updates += 1;
                    }
                    if old.data_type != new.data_type {
                        counts.type_updates += 1;
                    }
                    if old.primary_key_index != new.primary_key_index {
                        counts.pk_updates += 1;
                    }
                }
            }
        }
        counts.inserts = other
            .columns
            .iter()
            .filter(|new| !self.columns.iter().any(|c| c.id == new.id))
            .count();
        counts
    }

    /// Normalise a primary-key value to a tuple: a bare scalar becomes a
    /// one-element tuple, an array stays as-is.
    pub fn sanitise_pks(&self, pk: Value) -> Vec<Value> {
        match pk {
            Value::Array(values) => values,
            other => vec![other],
        }
    }
}

/// A stored schema snapshot: `[pk_column_ids, non_pk_column_ids]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Legend {
    pub pk_ids: Vec<String>,
    pub non_pk_ids: Vec<String>,
}

impl Legend {
    /// The identifier a feature blob references this legend by.
    pub fn hash(&self) -> String {
        hexhash(&self.to_bytes().expect("legend always encodes"))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StrataError> {
        json_pack(&(&self.pk_ids, &self.non_pk_ids))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Legend, StrataError> {
        let (pk_ids, non_pk_ids): (Vec<String>, Vec<String>) = serde_json::from_slice(bytes)?;
        Ok(Legend { pk_ids, non_pk_ids })
    }
}
