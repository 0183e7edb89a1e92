//! Key filters: recursive predicates restricting which items of a diff or
//! dataset are considered.
//!
//! These filters apply to "keys", not to "values" - meta item names,
//! stringified primary keys, tile names - so an item can be accepted or
//! rejected without loading its blob. Dataset paths additionally support
//! shell-style `*` globs (and only `*`; `?` and `[]` are not glob
//! metacharacters here).

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};

use crate::diff::diffs::DiffSection;
use crate::errors::StrataError;

/// Forbidden characters in a dataset path: `:<>"|?` and control characters.
fn bad_dataset_path_char(c: char) -> bool {
    matches!(c, ':' | '<' | '>' | '"' | '|' | '?') || (c as u32) < 0x20
}

/// Validate a dataset path (or dataset glob, when `allow_glob` is set).
pub fn validate_dataset_path(path: &str, allow_glob: bool) -> Result<(), StrataError> {
    let bad = |why: &str| {
        Err(StrataError::InvalidArgument(format!(
            "Invalid dataset path {path:?}: {why}"
        )))
    };
    if path.is_empty() {
        return bad("empty");
    }
    if path
        .chars()
        .any(|c| bad_dataset_path_char(c) || (c == '*' && !allow_glob))
    {
        return bad("forbidden character");
    }
    if path.starts_with('/') || path.ends_with('/') || path.starts_with('.') || path.ends_with('.')
    {
        return bad("leading or trailing '/' or '.'");
    }
    if path.contains("./") || path.contains("/.") {
        return bad("'./' or '/.' component");
    }
    Ok(())
}

/// Match `text` against `pattern`, where `*` matches any run of characters
/// and every other character matches itself.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    // Greedy star matching with backtracking.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut star_ti) = (None::<usize>, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// A key filter that matches item keys against a set of strings the user has
/// supplied, or everything when `match_all` is set.
#[derive(Clone, Debug, Default)]
pub struct ItemKeyFilter {
    keys: HashSet<String>,
    match_all: bool,
}

impl ItemKeyFilter {
    pub fn new() -> ItemKeyFilter {
        ItemKeyFilter::default()
    }

    pub fn match_all() -> ItemKeyFilter {
        ItemKeyFilter {
            keys: HashSet::new(),
            match_all: true,
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    pub fn add(&mut self, key: impl Into<String>) {
        if !self.match_all {
            self.keys.insert(key.into());
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.match_all || self.keys.contains(key)
    }

    /// True when the filter can match anything at all.
    pub fn is_active(&self) -> bool {
        self.match_all || !self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Per-dataset filter: one `ItemKeyFilter` per section (meta / feature /
/// tile), or match-all.
#[derive(Clone, Debug, Default)]
pub struct DatasetKeyFilter {
    sections: HashMap<DiffSection, ItemKeyFilter>,
    match_all: bool,
}

impl DatasetKeyFilter {
    pub fn new() -> DatasetKeyFilter {
        DatasetKeyFilter::default()
    }

    pub fn match_all() -> DatasetKeyFilter {
        DatasetKeyFilter {
            sections: HashMap::new(),
            match_all: true,
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    pub fn set(&mut self, section: DiffSection, filter: ItemKeyFilter) {
        if !self.match_all {
            self.sections.insert(section, filter);
        }
    }

    /// The filter for one section. A match-all dataset filter appears to
    /// contain a match-all child at every section.
    pub fn section(&self, section: DiffSection) -> ItemKeyFilter {
        if self.match_all {
            return ItemKeyFilter::match_all();
        }
        self.sections.get(&section).cloned().unwrap_or_default()
    }

    pub fn section_mut(&mut self, section: DiffSection) -> &mut ItemKeyFilter {
        self.sections.entry(section).or_default()
    }

    pub fn contains(&self, section: DiffSection, key: &str) -> bool {
        self.match_all
            || self
                .sections
                .get(&section)
                .is_some_and(|f| f.contains(key))
    }

    pub fn is_active(&self) -> bool {
        self.match_all || self.sections.values().any(|f| f.is_active())
    }
}

/// Repository-wide filter: one `DatasetKeyFilter` per dataset path, plus
/// glob entries, or match-all, optionally negated.
///
/// Built either programmatically ([`RepoKeyFilter::datasets`]) or from user
/// patterns of the form `<dataset-glob>[:(feature|meta|tile)][:<rest>]`.
#[derive(Clone, Debug, Default)]
pub struct RepoKeyFilter {
    datasets: HashMap<String, DatasetKeyFilter>,
    globs: Vec<(String, DatasetKeyFilter)>,
    match_all: bool,
    negate: bool,
}

impl RepoKeyFilter {
    pub fn new() -> RepoKeyFilter {
        RepoKeyFilter::default()
    }

    pub fn match_all() -> RepoKeyFilter {
        RepoKeyFilter {
            match_all: true,
            ..Default::default()
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all && !self.negate
    }

    /// A filter that matches everything in all of the given datasets.
    pub fn datasets<S: Into<String>>(paths: impl IntoIterator<Item = S>) -> RepoKeyFilter {
        let mut result = RepoKeyFilter::new();
        for path in paths {
            result.insert(path.into(), DatasetKeyFilter::match_all());
        }
        result
    }

    /// A filter that matches everything that is *not* in any of the given
    /// datasets.
    pub fn exclude_datasets<S: Into<String>>(paths: impl IntoIterator<Item = S>) -> RepoKeyFilter {
        let mut result = RepoKeyFilter::datasets(paths);
        result.negate = true;
        result
    }

    /// Given patterns like `["roads:1", "roads:2", "parks"]`, build a filter
    /// with the appropriate entries. No patterns means match-all.
    pub fn build_from_user_patterns<'a>(
        patterns: impl IntoIterator<Item = &'a str>,
    ) -> Result<RepoKeyFilter, StrataError> {
        let mut result = RepoKeyFilter::new();
        let mut any = false;
        for pattern in patterns {
            result.add_user_pattern(pattern)?;
            any = true;
        }
        Ok(if any { result } else { RepoKeyFilter::match_all() })
    }

    /// Parse one user pattern and merge it into this filter.
    pub fn add_user_pattern(&mut self, pattern: &str) -> Result<(), StrataError> {
        let (dataset_glob, section, rest) = parse_user_pattern(pattern)?;

        match section {
            None => {
                // Whole dataset.
                self.insert(dataset_glob, DatasetKeyFilter::match_all());
            }
            Some(section) => {
                let ds_filter = self.dataset_entry_mut(&dataset_glob);
                match rest {
                    // Specific feature, tile or meta item.
                    Some(rest) => ds_filter.section_mut(section).add(rest),
                    // All features, or all meta items.
                    None => ds_filter.set(section, ItemKeyFilter::match_all()),
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, path: String, filter: DatasetKeyFilter) {
        if self.match_all {
            return;
        }
        if path.contains('*') {
            self.globs.push((path, filter));
        } else {
            self.datasets.insert(path, filter);
        }
    }

    fn dataset_entry_mut(&mut self, path: &str) -> &mut DatasetKeyFilter {
        if path.contains('*') {
            if let Some(idx) = self.globs.iter().position(|(g, _)| g == path) {
                return &mut self.globs[idx].1;
            }
            self.globs.push((path.to_string(), DatasetKeyFilter::new()));
            return &mut self.globs.last_mut().unwrap().1;
        }
        self.datasets.entry(path.to_string()).or_default()
    }

    /// Whether this filter matches anything inside the given dataset.
    pub fn contains_dataset(&self, path: &str) -> bool {
        let contained = self.match_all
            || self.datasets.contains_key(path)
            || self.globs.iter().any(|(g, _)| glob_match(g, path));
        contained != self.negate
    }

    /// The per-dataset filter for the given dataset path. A match-all repo
    /// filter appears to contain a match-all child at every path.
    pub fn dataset_filter(&self, path: &str) -> DatasetKeyFilter {
        if self.negate {
            // Negated filters are dataset-granular: inside a matched dataset,
            // everything matches.
            return if self.contains_dataset(path) {
                DatasetKeyFilter::match_all()
            } else {
                DatasetKeyFilter::new()
            };
        }
        if self.match_all {
            return DatasetKeyFilter::match_all();
        }
        if let Some(f) = self.datasets.get(path) {
            return f.clone();
        }
        for (glob, f) in &self.globs {
            if glob_match(glob, path) {
                return f.clone();
            }
        }
        DatasetKeyFilter::new()
    }

    pub fn is_active(&self) -> bool {
        self.match_all || !self.datasets.is_empty() || !self.globs.is_empty()
    }
}

/// Split a user pattern into `(dataset_glob, section, rest)`.
///
/// A pattern with a `rest` but no explicit section implies `feature`, so
/// `roads:123` is equivalent to `roads:feature:123`. An empty `rest` is
/// treated as absent, so a stray trailing `:` (`roads:` or
/// `roads:feature:`) still matches the whole dataset or section.
fn parse_user_pattern(
    pattern: &str,
) -> Result<(String, Option<DiffSection>, Option<String>), StrataError> {
    let bad = || {
        StrataError::InvalidArgument(format!(
            "Invalid filter format, should be '<dataset>' or '<dataset>:<primary_key>': got {pattern:?}"
        ))
    };

    let mut parts = pattern.splitn(2, ':');
    let dataset_glob = parts.next().ok_or_else(bad)?;
    validate_dataset_path(dataset_glob, true).map_err(|_| bad())?;

    let Some(tail) = parts.next() else {
        return Ok((dataset_glob.to_string(), None, None));
    };
    if tail.is_empty() {
        return Ok((dataset_glob.to_string(), None, None));
    }

    let (section, rest) = match tail.split_once(':') {
        Some((head, rest)) => match DiffSection::from_str(head) {
            Some(section) => (section, (!rest.is_empty()).then(|| rest.to_string())),
            None => (DiffSection::Feature, Some(tail.to_string())),
        },
        None => match DiffSection::from_str(tail) {
            Some(section) => (section, None),
            None => (DiffSection::Feature, Some(tail.to_string())),
        },
    };
    Ok((dataset_glob.to_string(), Some(section), rest))
}
