//! # Query keys
//!
//! A [`QueryKey`] identifies "what data" a query loads. Keys are either a single
//! string or an ordered list of JSON values. Two keys denote the same query iff
//! their canonical forms are equal; canonicalization sorts object members at every
//! depth so construction order never changes identity, and writes whole-valued
//! floats in integer form so `1.0` and `1` name the same query.
//!
//! ```
//! use forge_query_core::{query_key, QueryKey};
//!
//! let a = query_key!["users", { "page": 1, "sort": "name" }];
//! let b = query_key!["users", { "sort": "name", "page": 1 }];
//! assert_eq!(a.hash(), b.hash());
//!
//! // structural prefixes: ["users"] covers ["users", ...] but not ["usersX"]
//! assert!(a.starts_with(&query_key!["users"]));
//! assert!(!query_key!["usersX"].starts_with(&query_key!["users"]));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a logical query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryKey {
    /// A single opaque string.
    Text(String),
    /// An ordered list of primitives and plain objects.
    Parts(Vec<Value>),
}

impl QueryKey {
    /// Builds an array key from anything convertible to JSON values.
    pub fn parts<I, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        QueryKey::Parts(parts.into_iter().map(Into::into).collect())
    }

    /// Canonical string form of this key.
    pub fn hash(&self) -> String {
        canonicalize(self)
    }

    /// Exact structural equality.
    pub fn matches(&self, other: &QueryKey) -> bool {
        keys_match(self, other)
    }

    /// Returns `true` if `prefix` structurally prefixes this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        is_prefix_of(self, prefix)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        QueryKey::Text(value.to_string())
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        QueryKey::Text(value)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        QueryKey::Parts(parts)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&canonicalize(self))
    }
}

/// Builds an array [`QueryKey`] from JSON-like literals.
///
/// Each part is one token tree: a literal, a variable, a `{ .. }` object, a
/// `[ .. ]` array or a parenthesized expression. A leading minus is accepted, so
/// negative numbers need no parentheses.
///
/// ```
/// use forge_query_core::query_key;
///
/// let key = query_key!["todos", 7, { "done": false }];
/// assert_eq!(key.hash(), r#"["todos",7,{"done":false}]"#);
///
/// let page = 3;
/// let key = query_key!["feed", -1, page, (page * 10)];
/// assert_eq!(key.hash(), r#"["feed",-1,3,30]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($tokens:tt)*) => {
        $crate::QueryKey::Parts($crate::__query_key_parts!([] $($tokens)*))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __query_key_parts {
    ([$($done:expr),*]) => {
        vec![$($done),*]
    };
    ([$($done:expr),*] - $part:tt $(, $($rest:tt)*)?) => {
        $crate::__query_key_parts!([$($done,)* $crate::__private::json!(-$part)] $($($rest)*)?)
    };
    ([$($done:expr),*] $part:tt $(, $($rest:tt)*)?) => {
        $crate::__query_key_parts!([$($done,)* $crate::__private::json!($part)] $($($rest)*)?)
    };
}

/// Converts a key into its canonical string.
///
/// Text keys are written JSON-quoted and array keys as a JSON array, so a text key
/// can never collide with an array key. Object members are sorted by name at every
/// depth; whitespace never appears in the output.
pub fn canonicalize(key: &QueryKey) -> String {
    let mut out = String::new();
    match key {
        QueryKey::Text(text) => write_string(text, &mut out),
        QueryKey::Parts(parts) => write_array(parts, &mut out),
    }
    out
}

/// Exact equality of two keys by canonical form.
pub fn keys_match(a: &QueryKey, b: &QueryKey) -> bool {
    canonicalize(a) == canonicalize(b)
}

/// Returns `true` when `prefix` structurally prefixes `candidate`.
///
/// Array keys are compared part by part, so `["users"]` prefixes
/// `["users", "1"]` but not `["usersX"]`. A text prefix only matches an equal
/// text key.
pub fn is_prefix_of(candidate: &QueryKey, prefix: &QueryKey) -> bool {
    match (candidate, prefix) {
        (QueryKey::Parts(parts), QueryKey::Parts(head)) => {
            head.len() <= parts.len()
                && head
                    .iter()
                    .zip(parts.iter())
                    .all(|(p, c)| canonical_value(p) == canonical_value(c))
        }
        (QueryKey::Text(text), QueryKey::Text(head)) => text == head,
        _ => false,
    }
}

fn canonical_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => write_array(items, out),
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> = map.iter().collect();
            members.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, member)) in members.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_value(member, out);
            }
            out.push('}');
        }
    }
}

fn write_array(items: &[Value], out: &mut String) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(item, out);
    }
    out.push(']');
}

// whole floats within the exact integer range share the integer form: `1.0` is `1`
fn write_number(n: &serde_json::Number, out: &mut String) {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= EXACT => {
            out.push_str(&(f as i64).to_string())
        }
        _ => out.push_str(&n.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Display on a JSON string value handles escaping
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use serde_json::json;

    #[test]
    fn test_object_member_order_is_irrelevant() {
        let a = query_key!["users", { "a": 1, "b": { "y": 2, "x": [1, { "q": 1, "p": 0 }] } }];
        let b = query_key!["users", { "b": { "x": [1, { "p": 0, "q": 1 }], "y": 2 }, "a": 1 }];
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert!(keys_match(&a, &b));
    }

    #[test]
    fn test_text_and_array_keys_never_collide() {
        let text = QueryKey::from(r#"["a"]"#);
        let parts = query_key!["a"];
        assert_ne!(canonicalize(&text), canonicalize(&parts));
        assert!(!keys_match(&text, &parts));
    }

    #[test]
    fn test_canonical_form_has_no_whitespace() {
        let key = QueryKey::Parts(vec![json!({ "name": "a b", "n": 1.5 }), json!(null), json!(true)]);
        assert_eq!(canonicalize(&key), r#"[{"n":1.5,"name":"a b"},null,true]"#);
    }

    #[test]
    fn test_structural_prefix() {
        assert!(is_prefix_of(&query_key!["a", "b"], &query_key!["a"]));
        assert!(!is_prefix_of(&query_key!["ab"], &query_key!["a"]));
        assert!(!is_prefix_of(&query_key!["usersX"], &query_key!["users"]));
        assert!(!is_prefix_of(&query_key!["a"], &query_key!["a", "b"]));
        assert!(is_prefix_of(&query_key!["a", { "x": 1, "y": 2 }], &query_key!["a", { "y": 2, "x": 1 }]));
    }

    #[test]
    fn test_empty_prefix_matches_every_array_key() {
        let empty = QueryKey::Parts(vec![]);
        assert!(is_prefix_of(&query_key!["anything", 1], &empty));
        assert!(!is_prefix_of(&QueryKey::from("text"), &empty));
    }

    #[test]
    fn test_text_prefix_requires_equal_text() {
        assert!(is_prefix_of(&QueryKey::from("users"), &QueryKey::from("users")));
        assert!(!is_prefix_of(&QueryKey::from("users-1"), &QueryKey::from("users")));
    }

    #[test]
    fn test_numbers_compare_by_value() {
        assert!(keys_match(&query_key![1], &query_key![1.0]));
        assert!(keys_match(&query_key![-2], &query_key![-2.0]));
        assert_eq!(canonicalize(&query_key!["page", 3.0]), r#"["page",3]"#);
        assert!(!keys_match(&query_key![1], &query_key![1.5]));
        assert!(!keys_match(&query_key![1], &query_key!["1"]));
        assert!(is_prefix_of(&query_key![2.0, "x"], &query_key![2]));
    }

    #[test]
    fn test_macro_accepts_negatives_and_expressions() {
        let offset = 5;
        let key = query_key!["items", -1, -offset, (offset + 1), [1, -2],];
        assert_eq!(canonicalize(&key), r#"["items",-1,-5,6,[1,-2]]"#);
        assert_eq!(query_key![], QueryKey::Parts(vec![]));
    }

    #[test]
    fn test_serde_round_trip_shapes() {
        let text: QueryKey = serde_json::from_str(r#""todos""#).unwrap();
        assert_eq!(text, QueryKey::from("todos"));
        let parts: QueryKey = serde_json::from_str(r#"["todos", 1]"#).unwrap();
        assert_eq!(parts, query_key!["todos", 1]);
    }
}
