//! Catalog payload types. Decoding is lenient: missing fields default and
//! unknown fields ride along in `extra` so the proxy never drops data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::params::Query;

/// Field decoders for WordPress-shaped rows, where a missing value may arrive
/// as `null` or `false`, a number as a string, a list as `{}` and a text as
/// `{"raw": .., "rendered": ..}`. None of them fail.
mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::{Map, Value};

    fn text_of(v: Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Object(mut m) => match m.remove("raw").or_else(|| m.remove("rendered")) {
                Some(Value::String(s)) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(text_of(Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(text_of(Value::deserialize(d)?).filter(|s| !s.is_empty()))
    }

    pub fn id<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        Ok(super::id_of(&Value::deserialize(d)?).unwrap_or(0))
    }

    pub fn map<'de, D: Deserializer<'de>>(d: D) -> Result<Map<String, Value>, D::Error> {
        match Value::deserialize(d)? {
            Value::Object(m) => Ok(m),
            _ => Ok(Map::new()),
        }
    }

    pub fn list<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        Ok(super::decode_list(&Value::deserialize(d)?))
    }
}

/// Non-negative integer id from a number or a numeric string.
pub fn id_of(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Taxonomy term (category or type).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Term {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: u64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub slug: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::id")]
    pub count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Patterns reference their categories either inline or by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TermRef {
    Id(u64),
    Term(Term),
}

impl TermRef {
    pub fn slug(&self) -> Option<&str> {
        match self {
            TermRef::Term(t) if !t.slug.is_empty() => Some(t.slug.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    #[serde(default, deserialize_with = "lenient::id")]
    pub id: u64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub content: String,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub link: String,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub featured_image: Option<String>,
    #[serde(default, deserialize_with = "lenient::list")]
    pub categories: Vec<TermRef>,
    /// keywords, viewport_width, inserter, and whatever else the remote sends.
    #[serde(default, deserialize_with = "lenient::map")]
    pub meta: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `fields=min` projection kept in cache for bulk listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub title: Value,
    #[serde(default)]
    pub link: Value,
    #[serde(default)]
    pub featured_image: Value,
}

impl PatternSummary {
    /// Project one raw row. Absent fields become `""`, id becomes null.
    pub fn from_row(row: &Map<String, Value>) -> Self {
        let text = |k: &str| row.get(k).cloned().unwrap_or_else(|| Value::String(String::new()));
        Self {
            id: row.get("id").and_then(id_of),
            title: text("title"),
            link: text("link"),
            featured_image: text("featured_image"),
        }
    }
}

/// Listing/search arguments as the UI sends them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternQuery {
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub orderby: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub category: Vec<u64>,
    #[serde(default, rename = "type")]
    pub kind: Vec<u64>,
}

impl PatternQuery {
    pub fn page(per_page: u32, page: u32) -> Self {
        Self {
            per_page: Some(per_page),
            page: Some(page),
            ..Self::default()
        }
    }

    pub fn sorted(mut self, orderby: &str, order: &str) -> Self {
        self.orderby = Some(orderby.to_string());
        self.order = Some(order.to_string());
        self
    }

    /// Read listing arguments out of a parsed request query. Unparseable
    /// numbers count as absent.
    pub fn from_query(q: &Query) -> Self {
        let num = |k: &str| q.get(k).and_then(|v| v.trim().parse::<u32>().ok());
        let text = |k: &str| q.get(k).map(str::to_string).filter(|v| !v.is_empty());
        Self {
            per_page: num("per_page"),
            page: num("page"),
            orderby: text("orderby"),
            order: text("order"),
            category: q.ids("category"),
            kind: q.ids("type"),
        }
    }
}

/// Result of the admin connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub ok: bool,
    pub code: u16,
    pub message: String,
}

/// Decode rows one by one, skipping any that do not fit.
pub fn decode_rows<T: serde::de::DeserializeOwned>(rows: &[Value]) -> Vec<T> {
    rows.iter()
        .filter_map(|v| match serde_json::from_value::<T>(v.clone()) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::debug!("[API] skipping undecodable row: {}", e);
                None
            }
        })
        .collect()
}

/// `decode_rows` over a JSON array; anything else is empty.
pub fn decode_list<T: serde::de::DeserializeOwned>(value: &Value) -> Vec<T> {
    match value {
        Value::Array(items) => decode_rows(items),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pattern_keeps_unknown_fields() {
        let raw = json!({
            "id": 7,
            "title": "Hero",
            "content": "<p>x</p>",
            "categories": [{"id": 3, "slug": "headers", "name": "Headers"}, 9],
            "meta": {"keywords": ["hero"]},
            "author": "someone"
        });
        let p: Pattern = serde_json::from_value(raw).unwrap();
        assert_eq!(p.id, 7);
        assert_eq!(p.categories[0].slug(), Some("headers"));
        assert_eq!(p.categories[1], TermRef::Id(9));
        assert_eq!(p.extra.get("author"), Some(&json!("someone")));
        let back = serde_json::to_value(&p).unwrap();
        assert_eq!(back["author"], "someone");
    }

    #[test]
    fn wordpress_shaped_rows_decode() {
        let raw = json!({
            "id": "12",
            "title": {"rendered": "Pricing &amp; plans"},
            "content": {"raw": "<!-- wp:group /-->", "rendered": "<div></div>"},
            "excerpt": null,
            "link": false,
            "featured_image": false,
            "categories": {},
            "meta": []
        });
        let p: Pattern = serde_json::from_value(raw).unwrap();
        assert_eq!(p.id, 12);
        assert_eq!(p.title, "Pricing &amp; plans");
        assert_eq!(p.content, "<!-- wp:group /-->");
        assert_eq!(p.excerpt, None);
        assert_eq!(p.link, "");
        assert_eq!(p.featured_image, None);
        assert!(p.categories.is_empty());
        assert!(p.meta.is_empty());

        let nulls: Pattern = serde_json::from_value(json!({"id": 3, "title": null})).unwrap();
        assert_eq!((nulls.id, nulls.title.as_str()), (3, ""));
        let t: Term = serde_json::from_value(json!({"id": "4", "slug": "hero", "name": null, "count": "2"})).unwrap();
        assert_eq!((t.id, t.count, t.name.as_str()), (4, 2, ""));
    }

    #[test]
    fn decode_list_skips_bad_rows() {
        let terms: Vec<Term> = decode_list(&json!([{"id": 1, "slug": "a"}, "oops", {"id": 2}]));
        assert_eq!(terms.len(), 2);
        let none: Vec<Term> = decode_list(&json!({"code": "rest_no_route"}));
        assert!(none.is_empty());
    }

    #[test]
    fn listing_args_from_request_query() {
        let q = PatternQuery::from_query(&Query::parse("per_page=abc&page=2&type[]=4&orderby="));
        assert_eq!(q.per_page, None);
        assert_eq!(q.page, Some(2));
        assert_eq!(q.orderby, None);
        assert_eq!(q.kind, vec![4]);
    }

    #[test]
    fn summary_projection_defaults_missing_fields() {
        let row = json!({"id": 4, "title": "T", "content": "big"});
        let s = PatternSummary::from_row(row.as_object().unwrap());
        assert_eq!(s.id, Some(4));
        let quoted = json!({"id": "5"});
        assert_eq!(PatternSummary::from_row(quoted.as_object().unwrap()).id, Some(5));
        assert_eq!(s.link, json!(""));
        let v = serde_json::to_value(&s).unwrap();
        assert!(v.get("content").is_none());
    }
}
