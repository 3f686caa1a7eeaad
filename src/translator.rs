use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Parses the bracketed JSON-path query dialect and rewrites it against
/// storage column names. Pure: resolving a path to a storage name (and
/// deciding whether that path is even allowed) is delegated to a caller
/// supplied closure backed by the collection's SchemaManager.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryTranslator;

enum Segment<'a> {
    Text(&'a str),
    Path(&'a str),
}

impl QueryTranslator {
    pub fn new() -> Self {
        Self
    }

    /// Replaces every `$NAME` token with its registered replacement text,
    /// before any bracket parsing happens.
    pub fn substitute_aliases(&self, clause: &str, aliases: &HashMap<String, String>) -> String {
        let mut result = clause.to_string();
        for (name, replacement) in aliases {
            result = result.replace(&format!("${name}"), replacement);
        }
        result
    }

    /// Returns the duplicate-free set of `[path]` references in `clause`.
    pub fn referenced_paths(&self, clause: &str) -> Result<HashSet<String>> {
        let mut paths = HashSet::new();
        for segment in parse_segments(clause)? {
            if let Segment::Path(path) = segment {
                paths.insert(path.to_string());
            }
        }
        Ok(paths)
    }

    /// Rewrites every `[path]` reference in a WHERE-clause fragment through
    /// `resolve`, leaving everything else (including `?` placeholders and
    /// unbracketed identifiers like `__rowid__`) untouched and in place.
    pub fn rewrite_where(
        &self,
        clause: &str,
        mut resolve: impl FnMut(&str) -> Result<String>,
    ) -> Result<String> {
        let mut out = String::with_capacity(clause.len());
        for segment in parse_segments(clause)? {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Path(path) => out.push_str(&resolve(path)?),
            }
        }
        Ok(out)
    }

    /// Rewrites a comma-separated ORDER BY clause, honoring a trailing
    /// `DESC`/`ASC` on each term.
    pub fn rewrite_order_by(
        &self,
        clause: &str,
        mut resolve: impl FnMut(&str) -> Result<String>,
    ) -> Result<String> {
        let mut terms = Vec::new();
        for term in clause.split(',') {
            let trimmed = term.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (field_part, direction) = split_direction(trimmed);
            let rewritten = self.rewrite_where(field_part, &mut resolve)?;
            terms.push(match direction {
                Some(dir) => format!("{rewritten} {dir}"),
                None => rewritten,
            });
        }
        Ok(terms.join(", "))
    }
}

fn split_direction(term: &str) -> (&str, Option<&'static str>) {
    let upper = term.to_ascii_uppercase();
    if upper.ends_with("DESC") && upper.len() > 4 {
        (term[..term.len() - 4].trim_end(), Some("DESC"))
    } else if upper.ends_with("ASC") && upper.len() > 3 {
        (term[..term.len() - 3].trim_end(), Some("ASC"))
    } else {
        (term, None)
    }
}

fn parse_segments(clause: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = clause;

    loop {
        match rest.find('[') {
            None => {
                if rest.contains(']') {
                    tracing::debug!(clause, "rejected clause with unmatched ']'");
                    return Err(Error::InvalidSqlArgument(format!(
                        "unmatched ']' in clause: {clause}"
                    )));
                }
                if !rest.is_empty() {
                    segments.push(Segment::Text(rest));
                }
                break;
            }
            Some(start) => {
                let (before, after_bracket) = rest.split_at(start);
                if before.contains(']') {
                    return Err(Error::InvalidSqlArgument(format!(
                        "unmatched ']' in clause: {clause}"
                    )));
                }
                if !before.is_empty() {
                    segments.push(Segment::Text(before));
                }

                let after = &after_bracket[1..];
                match after.find(']') {
                    None => {
                        return Err(Error::InvalidSqlArgument(format!(
                            "unmatched '[' in clause: {clause}"
                        )))
                    }
                    Some(end) => {
                        segments.push(Segment::Path(&after[..end]));
                        rest = &after[end + 1..];
                    }
                }
            }
        }
    }

    Ok(segments)
}

#[cfg(test)]
mod test {
    use super::*;

    fn upper_resolver(path: &str) -> Result<String> {
        Ok(path.to_uppercase())
    }

    #[test]
    fn substitutes_alias_tokens_before_parsing() {
        let translator = QueryTranslator::new();
        let mut aliases = HashMap::new();
        aliases.insert("ADULT".to_string(), "[age] >= 18".to_string());
        assert_eq!(
            translator.substitute_aliases("$ADULT AND [active] = ?", &aliases),
            "[age] >= 18 AND [active] = ?"
        );
    }

    #[test]
    fn extracts_duplicate_free_referenced_paths() {
        let translator = QueryTranslator::new();
        let paths = translator
            .referenced_paths("[name] = ? AND [name] != [nickname]")
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.contains("name"));
        assert!(paths.contains("nickname"));
    }

    #[test]
    fn rewrites_paths_preserving_placeholders_and_unbracketed_identifiers() {
        let translator = QueryTranslator::new();
        let rewritten = translator
            .rewrite_where("[age] >= ? AND __rowid__ != ?", upper_resolver)
            .unwrap();
        assert_eq!(rewritten, "AGE >= ? AND __rowid__ != ?");
    }

    #[test]
    fn rewrites_order_by_preserving_direction() {
        let translator = QueryTranslator::new();
        let rewritten = translator
            .rewrite_order_by("[lastName] DESC, [firstName]", upper_resolver)
            .unwrap();
        assert_eq!(rewritten, "LASTNAME DESC, FIRSTNAME");
    }

    #[test]
    fn rejects_unmatched_brackets() {
        let translator = QueryTranslator::new();
        assert!(matches!(
            translator.rewrite_where("[age >= ?", upper_resolver),
            Err(Error::InvalidSqlArgument(_))
        ));
        assert!(matches!(
            translator.rewrite_where("age] >= ?", upper_resolver),
            Err(Error::InvalidSqlArgument(_))
        ));
    }

    #[test]
    fn propagates_resolver_errors_for_disallowed_paths() {
        let translator = QueryTranslator::new();
        let result = translator.rewrite_where("[secret] = ?", |_| {
            Err(Error::InvalidSqlArgument("path not queryable".to_string()))
        });
        assert!(matches!(result, Err(Error::InvalidSqlArgument(_))));
    }
}
