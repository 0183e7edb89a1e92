//! The tabular dataset codec: feature blob paths derived from primary keys,
//! and feature blobs referencing schema legends.
//!
//! A feature's blob path is deterministic in the primary key only:
//! `feature/<aa>/<bb>/<pk-hex>`, where `pk-hex` is the hex encoding of the
//! canonical JSON array of PK values and `<aa><bb>` are the first four hex
//! chars of the SHA-256 of those bytes. Two commits importing the same PK
//! from the same schema therefore produce identical blob OIDs, which is
//! what makes deduplication structural.
//!
//! Feature blob bytes are `[legend_hash, [non-pk values in legend order]]`.
//! A feature carries its legend identifier embedded in the blob and the
//! legend is resolved from the dataset the feature is read from.

use serde_json::{Map, Value};

use crate::dataset::Dataset;
use crate::dataset::schema::Schema;
use crate::errors::StrataError;
use crate::serialise::{hexhash, json_pack, json_unpack};

/// Encode primary-key values to the feature's path relative to the dataset
/// marker directory.
pub fn encode_pk_values_to_rel_path(pk_values: &[Value]) -> Result<String, StrataError> {
    let packed = json_pack(&pk_values)?;
    let fan = hexhash(&packed);
    Ok(format!(
        "feature/{}/{}/{}",
        &fan[0..2],
        &fan[2..4],
        hex::encode(&packed)
    ))
}

/// Recover the primary-key values from an encoded blob filename.
pub fn decode_pk_values_from_name(name: &str) -> Result<Vec<Value>, StrataError> {
    let bytes = hex::decode(name).map_err(|_| {
        StrataError::InvalidArgument(format!("Not an encoded primary key: {name:?}"))
    })?;
    match json_unpack(&bytes)? {
        Value::Array(values) => Ok(values),
        other => Err(StrataError::InvalidArgument(format!(
            "Encoded primary key is not a tuple: {other}"
        ))),
    }
}

/// The display form of a primary key: values joined with commas, the form
/// used in diff keys, filters and conflict labels.
pub fn feature_key_string(pk_values: &[Value]) -> String {
    pk_values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Blob filename -> display key.
pub fn feature_key_from_encoded_name(name: &str) -> Result<String, StrataError> {
    Ok(feature_key_string(&decode_pk_values_from_name(name)?))
}

/// Encode a feature into `(rel_path, blob bytes)` under the given schema.
///
/// Fields are looked up by column name; a missing field encodes as null.
pub fn encode_feature(
    feature: &Map<String, Value>,
    schema: &Schema,
) -> Result<(String, Vec<u8>), StrataError> {
    let legend = schema.legend();
    let pk_values: Vec<Value> = schema
        .pk_columns()
        .iter()
        .map(|c| feature.get(&c.name).cloned().unwrap_or(Value::Null))
        .collect();
    let non_pk_values: Vec<Value> = schema
        .non_pk_columns()
        .iter()
        .map(|c| feature.get(&c.name).cloned().unwrap_or(Value::Null))
        .collect();

    let rel_path = encode_pk_values_to_rel_path(&pk_values)?;
    let blob = json_pack(&(legend.hash(), non_pk_values))?;
    Ok((rel_path, blob))
}

/// Decode a feature blob back into a `{column name: value}` map, resolving
/// its legend from the dataset it was read from.
pub fn decode_feature_blob(
    dataset: &Dataset,
    encoded_name: &str,
    blob: &[u8],
) -> Result<Value, StrataError> {
    let (legend_hash, non_pk_values): (String, Vec<Value>) = serde_json::from_slice(blob)?;
    let legend = dataset.legend(&legend_hash)?;
    let schema = dataset.schema()?;
    let pk_values = decode_pk_values_from_name(encoded_name)?;

    let name_for = |column_id: &str| {
        schema
            .columns
            .iter()
            .find(|c| c.id == column_id)
            .map(|c| c.name.clone())
            // A column the current schema no longer has keeps its id as name.
            .unwrap_or_else(|| column_id.to_string())
    };

    let mut feature = Map::new();
    for (id, value) in legend.pk_ids.iter().zip(pk_values) {
        feature.insert(name_for(id), value);
    }
    for (id, value) in legend.non_pk_ids.iter().zip(non_pk_values) {
        feature.insert(name_for(id), value);
    }
    Ok(Value::Object(feature))
}
