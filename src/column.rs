/// Prefix applied to every mangled storage name. Guarantees a projected
/// column can never collide with a reserved/built-in column name (`rowid`,
/// `__rowid__`, `__json__`) regardless of what JSON path produced it.
const STORAGE_PREFIX: &str = "c_";

/// A projected scalar column derived from one JSON path.
///
/// `storage_name` is a deterministic mangling of `path`, locked by the tests
/// below: lowercase the path, replace every run of non-alphanumeric
/// characters with a single underscore, and prefix with `c_`. Two different
/// paths that mangle to the same storage name are not expected to coexist in
/// a well-formed configuration; the SchemaManager works in storage-name
/// space precisely so this mapping only needs to be computed once per path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    path: String,
    storage_name: String,
}

impl Column {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let storage_name = mangle(&path);
        Self { path, storage_name }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    /// Returns the dotted ancestor paths this column depends on for
    /// projection, e.g. `"a.b.c"` depends on `"a"` and `"a.b"`. Does not
    /// include the path itself.
    pub fn ancestor_paths(&self) -> Vec<String> {
        let mut ancestors = Vec::new();
        let segments: Vec<&str> = self.path.split('.').collect();
        for i in 1..segments.len() {
            ancestors.push(segments[..i].join("."));
        }
        ancestors
    }
}

/// Deterministically mangles a dotted JSON path into an SQL-safe identifier.
/// Stable across process restarts: depends only on the path's characters.
pub fn mangle(path: &str) -> String {
    let mut out = String::with_capacity(STORAGE_PREFIX.len() + path.len());
    out.push_str(STORAGE_PREFIX);

    let mut last_was_underscore = false;
    for ch in path.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mangles_dotted_paths_deterministically() {
        let column = Column::new("address.city");
        assert_eq!(column.storage_name(), "c_address_city");
        assert_eq!(Column::new("address.city").storage_name(), column.storage_name());
    }

    #[test]
    fn mangles_are_lowercase_and_prefixed() {
        assert_eq!(mangle("Name"), "c_name");
        assert_eq!(mangle("__rowid__"), "c_rowid_");
    }

    #[test]
    fn collapses_runs_of_non_alphanumeric_characters() {
        assert_eq!(mangle("a..b"), "c_a_b");
        assert_eq!(mangle("a-b c"), "c_a_b_c");
    }

    #[test]
    fn reports_ancestor_paths() {
        let column = Column::new("a.b.c");
        assert_eq!(column.ancestor_paths(), vec!["a".to_string(), "a.b".to_string()]);

        let top_level = Column::new("name");
        assert!(top_level.ancestor_paths().is_empty());
    }
}
