//! Query normalization. Two logically equal requests must produce the same
//! URL byte for byte, since the URL is what the cache key hashes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A category/type filter as callers hand it in: `5`, `"5,6"` or `[6, "5"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Id(i64),
    Csv(String),
    List(Vec<Value>),
}

fn positive_id(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_i64().filter(|i| *i > 0).map(|i| i as u64),
        Value::String(s) => s.trim().parse::<i64>().ok().filter(|i| *i > 0).map(|i| i as u64),
        _ => None,
    }
}

impl FilterValue {
    /// Positive ids, de-duplicated and sorted.
    pub fn ids(&self) -> BTreeSet<u64> {
        match self {
            FilterValue::Id(i) if *i > 0 => std::iter::once(*i as u64).collect(),
            FilterValue::Id(_) => BTreeSet::new(),
            FilterValue::Csv(s) => s
                .split(',')
                .filter_map(|p| p.trim().parse::<i64>().ok())
                .filter(|i| *i > 0)
                .map(|i| i as u64)
                .collect(),
            FilterValue::List(items) => items.iter().filter_map(positive_id).collect(),
        }
    }
}

impl From<Vec<u64>> for FilterValue {
    fn from(v: Vec<u64>) -> Self {
        FilterValue::List(v.into_iter().map(Value::from).collect())
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Csv(s.to_string())
    }
}

/// Which repeated key a filter alias maps to.
fn filter_key(key: &str) -> Option<&'static str> {
    match key {
        "category" | "categories" => Some("category"),
        "type" | "types" => Some("type"),
        _ => None,
    }
}

/// Ordered parameter set. Scalars and id filters are both kept sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    scalars: BTreeMap<String, String>,
    filters: BTreeMap<&'static str, BTreeSet<u64>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Set a scalar. Filter aliases are routed to `add_filter`.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        if filter_key(key).is_some() {
            self.add_filter(key, &FilterValue::Csv(value));
            return;
        }
        self.scalars.insert(key.to_string(), value);
    }

    /// Set only when absent.
    pub fn set_default(&mut self, key: &str, value: impl ToString) {
        if !self.scalars.contains_key(key) {
            self.scalars.insert(key.to_string(), value.to_string());
        }
    }

    pub fn filter(mut self, key: &str, value: &FilterValue) -> Self {
        self.add_filter(key, value);
        self
    }

    /// Merge ids into the filter `key` maps to. Empty input leaves no trace.
    pub fn add_filter(&mut self, key: &str, value: &FilterValue) {
        let Some(k) = filter_key(key) else {
            return;
        };
        let ids = value.ids();
        if ids.is_empty() {
            return;
        }
        self.filters.entry(k).or_default().extend(ids);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.scalars.get(key).map(|s| s.as_str())
    }

    pub fn ids(&self, key: &str) -> Vec<u64> {
        filter_key(key)
            .and_then(|k| self.filters.get(k))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.filters.is_empty()
    }

    /// Parse an incoming query string. `category[]=5`, `category[0]=5`,
    /// `category=5,6` and repeated `category=5&category=6` all land in the
    /// same filter.
    pub fn parse(raw: &str) -> Self {
        let mut q = Query::new();
        for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
            let key = match k.find('[') {
                Some(i) if k.ends_with(']') => &k[..i],
                _ => &*k,
            };
            q.set(key, &*v);
        }
        q
    }

    /// `a=1&category=5&category=6&page=2`, keys in byte order.
    pub fn encode(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .scalars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, ids) in &self.filters {
            for id in ids {
                pairs.push((k.to_string(), id.to_string()));
            }
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish()
    }
}

/// Base joined to path with exactly one separator, plus the encoded query.
pub fn build_url(base: &str, path: &str, query: &Query) -> String {
    let mut url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.encode());
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn csv_list_and_reordered_filters_encode_identically() {
        let csv = Query::new().filter("category", &FilterValue::Csv("5, 6".into()));
        let list = Query::new().filter("categories", &FilterValue::from(vec![5, 6]));
        let rev: FilterValue = serde_json::from_value(json!([6, "5", 6])).unwrap();
        let reordered = Query::new().filter("category", &rev);
        assert_eq!(csv.encode(), "category=5&category=6");
        assert_eq!(csv, list);
        assert_eq!(list.encode(), reordered.encode());
    }

    #[test]
    fn invalid_filters_are_dropped_entirely() {
        let q = Query::new()
            .filter("type", &FilterValue::Csv("0,-3,abc".into()))
            .with("page", 1);
        assert_eq!(q.encode(), "page=1");
        assert!(q.ids("types").is_empty());
    }

    #[test]
    fn scalar_insertion_order_does_not_matter() {
        let a = Query::new().with("page", 2).with("order", "DESC");
        let b = Query::new().with("order", "DESC").with("page", 2);
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn build_url_uses_one_separator() {
        let q = Query::new();
        assert_eq!(build_url("https://x.test/v1/", "/patterns", &q), "https://x.test/v1/patterns");
        assert_eq!(build_url("https://x.test/v1", "patterns", &q), "https://x.test/v1/patterns");
        let q = Query::new().with("q", "hero banner");
        assert_eq!(
            build_url("https://x.test/v1/", "search", &q),
            "https://x.test/v1/search?q=hero+banner"
        );
    }

    #[test]
    fn parse_accepts_every_filter_spelling() {
        let a = Query::parse("category[]=6&category[]=5&per_page=3");
        let b = Query::parse("category%5B0%5D=5&category=6&per_page=3");
        let c = Query::parse("categories=5,6&per_page=3");
        assert_eq!(a.encode(), "category=5&category=6&per_page=3");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(Query::parse("q=hero+banner").get("q"), Some("hero banner"));
    }

    #[test]
    fn set_routes_filter_aliases() {
        let mut q = Query::new();
        q.set("types", "3,2");
        q.set_default("per_page", 10);
        q.set_default("per_page", 99);
        assert_eq!(q.ids("type"), vec![2, 3]);
        assert_eq!(q.get("per_page"), Some("10"));
    }
}
