//! Editor registrations: the category and pattern entries a block editor
//! registers from the catalog's first page.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::client::{ApiClient, BULK_PAGE_SIZE};
use crate::deps::truthy;
use crate::models::{Pattern, PatternQuery, Term};

pub const NAMESPACE: &str = "patterns";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryRegistration {
    pub slug: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRegistration {
    pub name: String,
    pub title: String,
    pub content: String,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserter: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Registrations {
    pub categories: Vec<CategoryRegistration>,
    pub patterns: Vec<PatternRegistration>,
}

/// Lowercase, runs of anything but `[a-z0-9_]` become one `-`, no leading or
/// trailing dashes.
pub fn sanitize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut dash = false;
    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' {
            if dash && !out.is_empty() {
                out.push('-');
            }
            dash = false;
            out.push(c);
        } else {
            dash = true;
        }
    }
    out
}

fn int_of(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .enumerate()
                .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
                .map(|(_, c)| c)
                .collect();
            digits.parse().unwrap_or(0)
        }
        Value::Bool(b) => *b as i64,
        _ => 0,
    }
}

fn pattern_registration(p: &Pattern) -> PatternRegistration {
    let slug = match sanitize_title(&p.title) {
        s if s.is_empty() => "pattern".to_string(),
        s => s,
    };
    let title = if p.title.is_empty() {
        format!("Pattern {}", p.id)
    } else {
        p.title.clone()
    };
    let mut categories: Vec<String> = Vec::new();
    for slug in p.categories.iter().filter_map(|t| t.slug()) {
        if !categories.iter().any(|c| c == slug) {
            categories.push(slug.to_string());
        }
    }
    let keywords = p.meta.get("keywords").and_then(Value::as_array).map(|list| {
        list.iter()
            .filter_map(Value::as_str)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    });
    PatternRegistration {
        name: format!("{}/{}-{}", NAMESPACE, slug, p.id),
        title,
        content: p.content.clone(),
        categories,
        description: p.excerpt.clone().filter(|e| !e.is_empty()),
        keywords,
        viewport_width: p.meta.get("viewport_width").map(int_of),
        inserter: p.meta.get("inserter").map(truthy),
    }
}

pub fn build_registrations(
    categories: &[Term],
    patterns: &[Pattern],
    max_register: usize,
) -> Registrations {
    let categories = categories
        .iter()
        .filter(|t| !t.slug.is_empty() && !t.name.is_empty())
        .map(|t| CategoryRegistration {
            slug: t.slug.clone(),
            label: t.name.clone(),
        })
        .collect();

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for p in patterns {
        if out.len() >= max_register {
            break;
        }
        let reg = pattern_registration(p);
        if !seen.insert(reg.name.clone()) {
            continue;
        }
        out.push(reg);
    }
    Registrations {
        categories,
        patterns: out,
    }
}

/// Categories plus the first listing page (at most 100 rows).
pub fn collect(api: &ApiClient, max_register: usize) -> Registrations {
    let per_page = (max_register as u32).min(BULK_PAGE_SIZE).max(1);
    let categories = api.get_categories();
    let patterns = api.get_patterns(&PatternQuery::page(per_page, 1));
    let regs = build_registrations(&categories, &patterns, max_register);
    tracing::debug!(
        "[REGISTER] {} categories, {} patterns",
        regs.categories.len(),
        regs.patterns.len()
    );
    regs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Kit, Reply};
    use serde_json::json;

    fn pattern(v: Value) -> Pattern {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn titles_become_slugs() {
        assert_eq!(sanitize_title("  Hero Banner!  "), "hero-banner");
        assert_eq!(sanitize_title("A -- B"), "a-b");
        assert_eq!(sanitize_title("???"), "");
    }

    #[test]
    fn maps_optional_fields() {
        let p = pattern(json!({
            "id": 12,
            "title": "Pricing Table",
            "content": "<div/>",
            "excerpt": "Three tiers",
            "categories": [{"id": 1, "slug": "pricing"}, {"id": 1, "slug": "pricing"}, 4],
            "meta": {"keywords": [" price ", "", "plans"], "viewport_width": "1200px", "inserter": 0}
        }));
        let regs = build_registrations(&[], &[p], 10);
        let r = &regs.patterns[0];
        assert_eq!(r.name, "patterns/pricing-table-12");
        assert_eq!(r.categories, vec!["pricing"]);
        assert_eq!(r.description.as_deref(), Some("Three tiers"));
        assert_eq!(r.keywords.as_ref().unwrap(), &vec!["price".to_string(), "plans".to_string()]);
        assert_eq!(r.viewport_width, Some(1200));
        assert_eq!(r.inserter, Some(false));
        let v = serde_json::to_value(r).unwrap();
        assert_eq!(v["viewportWidth"], 1200);
    }

    #[test]
    fn untitled_patterns_get_defaults() {
        let regs = build_registrations(&[], &[pattern(json!({"id": 3}))], 10);
        assert_eq!(regs.patterns[0].name, "patterns/pattern-3");
        assert_eq!(regs.patterns[0].title, "Pattern 3");
        assert!(regs.patterns[0].description.is_none());
    }

    #[test]
    fn duplicates_skipped_and_cap_applied() {
        let ps: Vec<Pattern> = vec![
            pattern(json!({"id": 1, "title": "A"})),
            pattern(json!({"id": 1, "title": "A"})),
            pattern(json!({"id": 2, "title": "B"})),
            pattern(json!({"id": 3, "title": "C"})),
        ];
        let regs = build_registrations(&[], &ps, 2);
        let names: Vec<&str> = regs.patterns.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["patterns/a-1", "patterns/b-2"]);
    }

    #[test]
    fn categories_need_slug_and_name() {
        let terms: Vec<Term> = serde_json::from_value(json!([
            {"id": 1, "slug": "hero", "name": "Hero"},
            {"id": 2, "slug": "nameless"}
        ]))
        .unwrap();
        let regs = build_registrations(&terms, &[], 10);
        assert_eq!(
            regs.categories,
            vec![CategoryRegistration {
                slug: "hero".into(),
                label: "Hero".into()
            }]
        );
    }

    #[test]
    fn collect_reads_first_page_sized_to_the_cap() {
        let kit = Kit::new();
        kit.transport.on("patterns", Reply::json(json!([{"id": 1, "title": "One"}])));
        let regs = collect(&kit.api, 40);
        assert_eq!(regs.patterns.len(), 1);
        assert!(kit.transport.urls().iter().any(|u| u.contains("per_page=40") && u.contains("page=1")));
    }
}
