use crate::column::mangle;

/// A secondary index over an ordered list of columns, derived from one or
/// more JSON paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Index {
    keys: Vec<String>,
    unique: bool,
    name: String,
}

impl Index {
    pub fn new(keys: impl Into<Vec<String>>, unique: bool) -> Self {
        let keys = keys.into();
        let name = index_name(&keys, unique);
        Self { keys, unique, name }
    }

    /// Parses a comma-separated keys string (`"lastName, firstName"`) as the
    /// original API accepts for `add_index`/`add_unique_index`.
    pub fn parse(keys: &str, unique: bool) -> Self {
        let keys: Vec<String> = keys
            .split(',')
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        Self::new(keys, unique)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn keys_string(&self) -> String {
        self.keys.join(", ")
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Deterministically names an index from its keys and uniqueness, stable
/// across restarts. Distinct (keys, unique) pairs never collide because the
/// uniqueness flag is encoded as a literal suffix outside the mangled key
/// portion.
fn index_name(keys: &[String], unique: bool) -> String {
    let mangled_keys: Vec<String> = keys.iter().map(|key| mangle(key)).collect();
    let suffix = if unique { "uniq" } else { "idx" };
    format!("ix_{}_{}", mangled_keys.join("_"), suffix)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_comma_separated_keys() {
        let index = Index::parse("lastName, firstName", false);
        assert_eq!(index.keys(), &["lastName".to_string(), "firstName".to_string()]);
    }

    #[test]
    fn name_is_deterministic_and_distinguishes_uniqueness() {
        let a = Index::new(vec!["name".to_string()], false);
        let b = Index::new(vec!["name".to_string()], false);
        let c = Index::new(vec!["name".to_string()], true);
        assert_eq!(a.name(), b.name());
        assert_ne!(a.name(), c.name());
    }
}
