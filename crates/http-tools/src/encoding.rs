//! Request encoding helpers: path substitution, query serialization, URL assembly.
//!
//! Query serialization follows the `OpenAPI` 3 `style`/`explode` rules for query parameters.

use serde_json::{Map, Value};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStyle {
    #[default]
    Form,
    SpaceDelimited,
    PipeDelimited,
    DeepObject,
}

impl QueryStyle {
    #[must_use]
    pub fn default_explode(self) -> bool {
        matches!(self, Self::Form | Self::DeepObject)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuerySerialization {
    pub style: QueryStyle,
    pub explode: bool,
    pub allow_reserved: bool,
    pub allow_empty_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPair {
    pub key: String,
    pub value: String,
    pub allow_reserved: bool,
}

impl QueryPair {
    fn new(key: impl Into<String>, value: String, allow_reserved: bool) -> Self {
        Self {
            key: key.into(),
            value,
            allow_reserved,
        }
    }
}

/// Convert a JSON value to a string for URL/header parameters.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

/// Serialize one query parameter into zero or more `key=value` pairs.
///
/// Empty values are dropped unless the parameter is required or allows empty values.
#[must_use]
pub fn serialize_query_param(
    name: &str,
    value: &Value,
    required: bool,
    ser: QuerySerialization,
) -> Vec<QueryPair> {
    let allow_reserved = ser.allow_reserved;

    if query_value_is_empty(value) {
        if ser.allow_empty_value || required {
            return vec![QueryPair::new(name, String::new(), allow_reserved)];
        }
        return Vec::new();
    }

    match value {
        Value::Array(arr) => serialize_query_array(name, arr, ser),
        Value::Object(map) => serialize_query_object(name, map, ser),
        _ => vec![QueryPair::new(name, value_to_string(value), allow_reserved)],
    }
}

fn query_value_is_empty(value: &Value) -> bool {
    match value {
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

fn serialize_query_array(name: &str, arr: &[Value], ser: QuerySerialization) -> Vec<QueryPair> {
    let items: Vec<String> = arr.iter().map(value_to_string).collect();
    let joined = |sep: &str| vec![QueryPair::new(name, items.join(sep), ser.allow_reserved)];
    match ser.style {
        QueryStyle::Form if ser.explode => items
            .iter()
            .map(|v| QueryPair::new(name, v.clone(), ser.allow_reserved))
            .collect(),
        QueryStyle::Form | QueryStyle::DeepObject => joined(","),
        QueryStyle::SpaceDelimited => joined(" "),
        QueryStyle::PipeDelimited => joined("|"),
    }
}

fn serialize_query_object(
    name: &str,
    map: &Map<String, Value>,
    ser: QuerySerialization,
) -> Vec<QueryPair> {
    match ser.style {
        QueryStyle::DeepObject => map
            .iter()
            .map(|(k, v)| QueryPair::new(format!("{name}[{k}]"), value_to_string(v), ser.allow_reserved))
            .collect(),
        QueryStyle::Form if ser.explode => map
            .iter()
            .map(|(k, v)| QueryPair::new(k.clone(), value_to_string(v), ser.allow_reserved))
            .collect(),
        QueryStyle::Form => {
            let parts: Vec<String> = map
                .iter()
                .flat_map(|(k, v)| [k.clone(), value_to_string(v)])
                .collect();
            vec![QueryPair::new(name, parts.join(","), ser.allow_reserved)]
        }
        QueryStyle::SpaceDelimited | QueryStyle::PipeDelimited => vec![QueryPair::new(
            name,
            Value::Object(map.clone()).to_string(),
            ser.allow_reserved,
        )],
    }
}

/// Percent-encode a query key or value.
///
/// Only RFC 3986 unreserved characters pass through. With `allow_reserved`, reserved characters
/// other than the pair separators `&`, `=` and `#` are kept too.
#[must_use]
pub fn encode_query_component(s: &str, allow_reserved: bool) -> String {
    percent_encode(s, |b| {
        is_unreserved(b) || (allow_reserved && is_reserved_but_safe_in_pairs(b))
    })
}

/// Percent-encode a value substituted into a single path segment (`/` is encoded too).
#[must_use]
pub fn encode_path_segment(s: &str) -> String {
    percent_encode(s, is_unreserved)
}

fn percent_encode(s: &str, keep: impl Fn(u8) -> bool) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if keep(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn is_unreserved(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~')
}

fn is_reserved_but_safe_in_pairs(b: u8) -> bool {
    matches!(
        b,
        b':' | b'/'
            | b'?'
            | b'['
            | b']'
            | b'@'
            | b'!'
            | b'$'
            | b'\''
            | b'('
            | b')'
            | b'*'
            | b'+'
            | b','
            | b';'
    )
}

/// Join encoded pairs into `k=v&k2=v2`.
#[must_use]
pub fn encode_pairs(pairs: &[QueryPair]) -> String {
    pairs
        .iter()
        .map(|p| {
            format!(
                "{}={}",
                encode_query_component(&p.key, false),
                encode_query_component(&p.value, p.allow_reserved)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// `base_url` (trailing slash trimmed) + `path` + encoded query.
///
/// # Errors
///
/// Returns the URL parse error if the joined string is not a valid absolute URL.
pub fn build_url(base_url: &str, path: &str, query: &[QueryPair]) -> Result<Url, url::ParseError> {
    let sep = if path.starts_with('/') { "" } else { "/" };
    let mut url = Url::parse(&format!("{}{sep}{path}", base_url.trim_end_matches('/')))?;
    if !query.is_empty() {
        url.set_query(Some(&encode_pairs(query)));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ser(style: QueryStyle, explode: bool) -> QuerySerialization {
        QuerySerialization {
            style,
            explode,
            ..QuerySerialization::default()
        }
    }

    fn rendered(pairs: &[QueryPair]) -> String {
        encode_pairs(pairs)
    }

    #[test]
    fn value_to_string_renders_scalars_plainly() {
        assert_eq!(value_to_string(&json!("a b")), "a b");
        assert_eq!(value_to_string(&json!(42)), "42");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&Value::Null), "");
        assert_eq!(value_to_string(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn arrays_respect_style_and_explode() {
        let v = json!(["a", "b"]);
        assert_eq!(
            rendered(&serialize_query_param("tags", &v, false, ser(QueryStyle::Form, true))),
            "tags=a&tags=b"
        );
        assert_eq!(
            rendered(&serialize_query_param("tags", &v, false, ser(QueryStyle::Form, false))),
            "tags=a%2Cb"
        );
        assert_eq!(
            rendered(&serialize_query_param(
                "tags",
                &v,
                false,
                ser(QueryStyle::PipeDelimited, false)
            )),
            "tags=a%7Cb"
        );
    }

    #[test]
    fn deep_object_expands_keys() {
        let v = json!({"color": "red"});
        assert_eq!(
            rendered(&serialize_query_param("filter", &v, false, ser(QueryStyle::DeepObject, true))),
            "filter%5Bcolor%5D=red"
        );
    }

    #[test]
    fn empty_optional_values_are_dropped() {
        let s = ser(QueryStyle::Form, true);
        assert!(serialize_query_param("q", &json!(""), false, s).is_empty());
        assert_eq!(serialize_query_param("q", &json!(""), true, s).len(), 1);
    }

    #[test]
    fn path_segments_encode_slashes_and_spaces() {
        assert_eq!(encode_path_segment("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_path_segment("bike-123"), "bike-123");
    }

    #[test]
    fn allow_reserved_keeps_separators_safe() {
        assert_eq!(encode_query_component("a/b&c", true), "a/b%26c");
        assert_eq!(encode_query_component("a/b&c", false), "a%2Fb%26c");
    }

    #[test]
    fn build_url_joins_base_and_path() {
        let pairs = vec![QueryPair::new("limit", "10".to_string(), false)];
        let url = build_url("http://api.local/v1/", "/bikes", &pairs).expect("url");
        assert_eq!(url.as_str(), "http://api.local/v1/bikes?limit=10");

        let url = build_url("http://api.local", "bikes", &[]).expect("url");
        assert_eq!(url.as_str(), "http://api.local/bikes");
    }
}
