//! The hierarchical diff containers: `RepoDiff` holds `DatasetDiff`s holds
//! `DeltaDiff`s holds `Delta`s. Concatenation is defined recursively: all
//! children with matching keys are concatenated, and a key whose
//! concatenation comes out empty is removed.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::diff::delta::{Delta, DeltaType, KeyValue};
use crate::errors::StrataError;

/// The section of a dataset a delta belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiffSection {
    Meta,
    Feature,
    Tile,
}

impl DiffSection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DiffSection::Meta => "meta",
            DiffSection::Feature => "feature",
            DiffSection::Tile => "tile",
        }
    }

    pub fn from_str(s: &str) -> Option<DiffSection> {
        match s {
            "meta" => Some(DiffSection::Meta),
            "feature" => Some(DiffSection::Feature),
            "tile" => Some(DiffSection::Tile),
            _ => None,
        }
    }
}

impl std::fmt::Display for DiffSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The inner-most diff: the one that actually contains deltas, keyed by the
/// delta's own key.
#[derive(Debug, Default)]
pub struct DeltaDiff {
    deltas: BTreeMap<String, Delta>,
}

impl DeltaDiff {
    pub fn new() -> DeltaDiff {
        DeltaDiff::default()
    }

    /// Collect deltas, storing each at its own key.
    pub fn from_deltas(deltas: impl IntoIterator<Item = Delta>) -> DeltaDiff {
        let mut result = DeltaDiff::new();
        for delta in deltas {
            result.add_delta(delta);
        }
        result
    }

    /// Diff two plain maps of decoded values into deltas.
    pub fn diff_maps(
        old: &BTreeMap<String, Value>,
        new: &BTreeMap<String, Value>,
        delta_flags: u8,
    ) -> DeltaDiff {
        let mut result = DeltaDiff::new();
        let keys: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for k in keys {
            let old_value = old.get(k.as_str());
            let new_value = new.get(k.as_str());
            if old_value == new_value {
                continue;
            }
            let mut delta = Delta::new(
                old_value.map(|v| KeyValue::new(k.clone(), v.clone())),
                new_value.map(|v| KeyValue::new(k.clone(), v.clone())),
            )
            .expect("at least one side is present");
            delta.flags = delta_flags;
            result.add_delta(delta);
        }
        result
    }

    /// Add the given delta at the appropriate key.
    pub fn add_delta(&mut self, delta: Delta) {
        self.deltas.insert(delta.key().to_string(), delta);
    }

    pub fn get(&self, key: &str) -> Option<&Delta> {
        self.deltas.get(key)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Delta)> {
        self.deltas.iter()
    }

    pub fn into_deltas(self) -> impl Iterator<Item = Delta> {
        self.deltas.into_values()
    }

    pub fn invert(self) -> DeltaDiff {
        DeltaDiff::from_deltas(self.deltas.into_values().map(Delta::invert))
    }

    /// Concatenate with a subsequent diff of the same shape. Deltas at
    /// matching keys compose; a composition that cancels out removes the key.
    pub fn concat(mut self, other: DeltaDiff) -> Result<DeltaDiff, StrataError> {
        for (key, rhs) in other.deltas {
            match self.deltas.remove(&key) {
                Some(lhs) => {
                    if let Some(both) = lhs.concat(rhs)? {
                        self.deltas.insert(key, both);
                    }
                }
                None => {
                    self.deltas.insert(key, rhs);
                }
            }
        }
        Ok(self)
    }

    /// Count deltas by type, e.g. `{"inserts": 2, "deletes": 1}`.
    pub fn type_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut result = BTreeMap::new();
        for delta in self.deltas.values() {
            let name = match delta.delta_type() {
                DeltaType::Insert => "inserts",
                DeltaType::Update => "updates",
                DeltaType::Delete => "deletes",
            };
            *result.entry(name).or_insert(0) += 1;
        }
        result
    }
}

/// All the changes within one dataset: up to one `DeltaDiff` per section.
#[derive(Debug, Default)]
pub struct DatasetDiff {
    sections: BTreeMap<DiffSection, DeltaDiff>,
}

impl DatasetDiff {
    pub fn new() -> DatasetDiff {
        DatasetDiff::default()
    }

    pub fn set_if_nonempty(&mut self, section: DiffSection, diff: DeltaDiff) {
        if !diff.is_empty() {
            self.sections.insert(section, diff);
        }
    }

    pub fn get(&self, section: DiffSection) -> Option<&DeltaDiff> {
        self.sections.get(&section)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&DiffSection, &DeltaDiff)> {
        self.sections.iter()
    }

    pub fn into_sections(self) -> impl Iterator<Item = (DiffSection, DeltaDiff)> {
        self.sections.into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.values().all(|d| d.is_empty())
    }

    /// Total number of deltas across all sections.
    pub fn len(&self) -> usize {
        self.sections.values().map(|d| d.len()).sum()
    }

    pub fn invert(self) -> DatasetDiff {
        let mut result = DatasetDiff::new();
        for (section, diff) in self.sections {
            result.sections.insert(section, diff.invert());
        }
        result
    }

    pub fn concat(mut self, other: DatasetDiff) -> Result<DatasetDiff, StrataError> {
        for (section, rhs) in other.sections {
            match self.sections.remove(&section) {
                Some(lhs) => {
                    let both = lhs.concat(rhs)?;
                    if !both.is_empty() {
                        self.sections.insert(section, both);
                    }
                }
                None => {
                    self.sections.insert(section, rhs);
                }
            }
        }
        Ok(self)
    }
}

/// All the changes within one repository: one `DatasetDiff` per changed
/// dataset, keyed by dataset path.
#[derive(Debug, Default)]
pub struct RepoDiff {
    datasets: BTreeMap<String, DatasetDiff>,
}

impl RepoDiff {
    pub fn new() -> RepoDiff {
        RepoDiff::default()
    }

    pub fn set_if_nonempty(&mut self, dataset_path: impl Into<String>, diff: DatasetDiff) {
        if !diff.is_empty() {
            self.datasets.insert(dataset_path.into(), diff);
        }
    }

    pub fn get(&self, dataset_path: &str) -> Option<&DatasetDiff> {
        self.datasets.get(dataset_path)
    }

    pub fn datasets(&self) -> impl Iterator<Item = (&String, &DatasetDiff)> {
        self.datasets.iter()
    }

    pub fn into_datasets(self) -> impl Iterator<Item = (String, DatasetDiff)> {
        self.datasets.into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.values().all(|d| d.is_empty())
    }

    /// Total number of deltas across all datasets.
    pub fn len(&self) -> usize {
        self.datasets.values().map(|d| d.len()).sum()
    }

    pub fn invert(self) -> RepoDiff {
        let mut result = RepoDiff::new();
        for (path, diff) in self.datasets {
            result.datasets.insert(path, diff.invert());
        }
        result
    }

    pub fn concat(mut self, other: RepoDiff) -> Result<RepoDiff, StrataError> {
        for (path, rhs) in other.datasets {
            match self.datasets.remove(&path) {
                Some(lhs) => {
                    let both = lhs.concat(rhs)?;
                    if !both.is_empty() {
                        self.datasets.insert(path, both);
                    }
                }
                None => {
                    self.datasets.insert(path, rhs);
                }
            }
        }
        Ok(self)
    }

    /// Concatenate a sequence of diffs, returning a new diff.
    pub fn concatenated(
        diffs: impl IntoIterator<Item = RepoDiff>,
    ) -> Result<RepoDiff, StrataError> {
        let mut result = RepoDiff::new();
        for diff in diffs {
            result = result.concat(diff)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn kv(key: &str, value: serde_json::Value) -> KeyValue {
        KeyValue::new(key, value)
    }

    fn feature_diff(deltas: Vec<Delta>) -> DatasetDiff {
        let mut ds = DatasetDiff::new();
        ds.set_if_nonempty(DiffSection::Feature, DeltaDiff::from_deltas(deltas));
        ds
    }

    #[test]
    fn test_diff_maps() {
        let old = BTreeMap::from([
            ("1".to_string(), json!("a")),
            ("2".to_string(), json!("b")),
        ]);
        let new = BTreeMap::from([
            ("1".to_string(), json!("A")),
            ("3".to_string(), json!("c")),
        ]);
        let diff = DeltaDiff::diff_maps(&old, &new, 0);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff.get("1").unwrap().delta_type(), DeltaType::Update);
        assert_eq!(diff.get("2").unwrap().delta_type(), DeltaType::Delete);
        assert_eq!(diff.get("3").unwrap().delta_type(), DeltaType::Insert);
    }

    #[test]
    fn test_concat_removes_cancelled_keys() {
        let a = DeltaDiff::from_deltas([Delta::insert(kv("1", json!("a")))]);
        let b = DeltaDiff::from_deltas([Delta::delete(kv("1", json!("a")))]);
        let both = a.concat(b).unwrap();
        assert!(both.is_empty());
    }

    #[test]
    fn test_concat_keeps_unmatched_keys() {
        let a = DeltaDiff::from_deltas([Delta::insert(kv("1", json!("a")))]);
        let b = DeltaDiff::from_deltas([Delta::insert(kv("2", json!("b")))]);
        let both = a.concat(b).unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn test_repo_diff_concat_is_associative() {
        let make = |k: &str, old: Option<&str>, new: Option<&str>| {
            let delta = Delta::new(
                old.map(|v| kv(k, json!(v))),
                new.map(|v| kv(k, json!(v))),
            )
            .unwrap();
            let mut repo = RepoDiff::new();
            repo.set_if_nonempty("points", feature_diff(vec![delta]));
            repo
        };

        // (A + B) + C
        let left = make("1", None, Some("a"))
            .concat(make("1", Some("a"), Some("b")))
            .unwrap()
            .concat(make("1", Some("b"), Some("c")))
            .unwrap();
        // A + (B + C)
        let right = make("1", None, Some("a"))
            .concat(
                make("1", Some("a"), Some("b"))
                    .concat(make("1", Some("b"), Some("c")))
                    .unwrap(),
            )
            .unwrap();

        let left_delta = left
            .get("points")
            .unwrap()
            .get(DiffSection::Feature)
            .unwrap()
            .get("1")
            .unwrap();
        let right_delta = right
            .get("points")
            .unwrap()
            .get(DiffSection::Feature)
            .unwrap()
            .get("1")
            .unwrap();
        assert_eq!(left_delta.delta_type(), DeltaType::Insert);
        assert_eq!(right_delta.delta_type(), DeltaType::Insert);
        assert_eq!(
            left_delta.new.as_ref().unwrap().value(),
            right_delta.new.as_ref().unwrap().value()
        );
    }

    #[test]
    fn test_invert_roundtrip() {
        let mut repo = RepoDiff::new();
        repo.set_if_nonempty(
            "points",
            feature_diff(vec![
                Delta::insert(kv("3", json!("c"))),
                Delta::update(kv("1", json!("a")), kv("1", json!("A"))),
            ]),
        );
        let back = repo.invert().invert();
        let diff = back
            .get("points")
            .unwrap()
            .get(DiffSection::Feature)
            .unwrap();
        assert_eq!(diff.get("3").unwrap().delta_type(), DeltaType::Insert);
        assert_eq!(diff.get("1").unwrap().delta_type(), DeltaType::Update);
    }

    #[test]
    fn test_type_counts() {
        let diff = DeltaDiff::from_deltas([
            Delta::insert(kv("1", json!("a"))),
            Delta::insert(kv("2", json!("b"))),
            Delta::delete(kv("3", json!("c"))),
        ]);
        let counts = diff.type_counts();
        assert_eq!(counts.get("inserts"), Some(&2));
        assert_eq!(counts.get("deletes"), Some(&1));
        assert_eq!(counts.get("updates"), None);
    }
}
