use std::collections::BTreeMap;
use std::fmt;

/// Field name -> matched text values, in match order.
pub type ResultRecord = BTreeMap<String, Vec<String>>;

/// URL -> record, one entry per successfully harvested URL.
pub type ResultMap = BTreeMap<String, ResultRecord>;

/// Ordered mapping from field name to path expression.
///
/// Field names are unique: inserting an existing name replaces its
/// expression but keeps the original position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryMap {
    entries: Vec<(String, String)>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, expression: impl Into<String>) {
        let field = field.into();
        let expression = expression.into();
        match self.entries.iter_mut().find(|(name, _)| *name == field) {
            Some(entry) => entry.1 = expression,
            None => self.entries.push((field, expression)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, expression)| expression.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, expression)| (name.as_str(), expression.as_str()))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for QueryMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = QueryMap::new();
        for (field, expression) in iter {
            map.insert(field, expression);
        }
        map
    }
}

/// A `name:value` pair that could not be split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParseError {
    pub input: String,
}

impl fmt::Display for QueryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected `name:value`, got `{}`", self.input)
    }
}

impl std::error::Error for QueryParseError {}

/// Split `name:value` on the first `:`. The name is trimmed and must not be
/// empty; the value is kept verbatim since expressions may contain `:`.
pub fn parse_pair(input: &str) -> Result<(String, String), QueryParseError> {
    match input.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(QueryParseError {
            input: input.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinsert_keeps_position_and_replaces_expression() {
        let map: QueryMap = [("title", "//h1"), ("price", "//b"), ("title", "//h2")]
            .into_iter()
            .collect();

        assert_eq!(map.len(), 2);
        assert_eq!(map.field_names().collect::<Vec<_>>(), vec!["title", "price"]);
        assert_eq!(map.get("title"), Some("//h2"));
    }

    #[test]
    fn pair_splits_on_first_colon_only() {
        assert_eq!(
            parse_pair("link:descendant::a/@href").unwrap(),
            ("link".to_string(), "descendant::a/@href".to_string())
        );
        assert!(parse_pair("no-separator").is_err());
        assert!(parse_pair(" :value").is_err());
    }
}
