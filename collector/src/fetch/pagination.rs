//! Pagination styles and item extraction

use crate::error::FetchError;
use reqwest::header::{HeaderMap, LINK};
use serde_json::Value;

/// How the next page is located
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Pagination {
    /// Single request
    #[default]
    None,
    /// Absolute next URL inside the body, at a JSON pointer
    /// (e.g. `/@odata.nextLink`)
    BodyLink(String),
    /// `Link: <...>; rel="next"` response header
    LinkHeader,
    /// `?{param}=N` starting at `start`, stopping at the first empty page
    PageNumber { param: String, start: u32 },
}

impl Pagination {
    pub fn body_link(pointer: impl Into<String>) -> Self {
        Pagination::BodyLink(pointer.into())
    }

    pub fn page_number(param: impl Into<String>, start: u32) -> Self {
        Pagination::PageNumber {
            param: param.into(),
            start,
        }
    }
}

/// Pull the item list out of a response body
///
/// An empty pointer means the body root. A missing or null list is an empty
/// page; anything that is not an array is a decode error.
pub fn extract_items(body: Value, pointer: &str) -> Result<Vec<Value>, FetchError> {
    let list = if pointer.is_empty() {
        body
    } else {
        match body.pointer(pointer) {
            Some(v) => v.clone(),
            None => Value::Null,
        }
    };
    match list {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(FetchError::Decode(format!(
            "expected a list at '{pointer}', found {}",
            json_kind(&other)
        ))),
    }
}

/// Next link from a body pointer, when it is a non-empty string
pub fn body_next_link(body: &Value, pointer: &str) -> Option<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `rel="next"` target across every `Link` header of a response
pub fn header_next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(parse_link_header)
}

/// Find the `rel="next"` target in one `Link` header value
pub fn parse_link_header(value: &str) -> Option<String> {
    value.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        let is_next = parts.any(|param| {
            let Some((key, val)) = param.split_once('=') else {
                return false;
            };
            key.trim().eq_ignore_ascii_case("rel")
                && val
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case("next"))
        });
        is_next.then(|| url.to_string())
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_extract_items_root_and_pointer() {
        assert_eq!(extract_items(json!([1, 2]), "").unwrap().len(), 2);
        assert_eq!(
            extract_items(json!({"value": [{"id": 1}]}), "/value").unwrap(),
            vec![json!({"id": 1})]
        );
        assert!(extract_items(json!({"other": 1}), "/value").unwrap().is_empty());
        assert!(extract_items(json!({"value": "x"}), "/value").is_err());
    }

    #[test]
    fn test_parse_link_header_finds_next() {
        let value = r#"<https://x.okta.com/api/v1/users?limit=200>; rel="self", <https://x.okta.com/api/v1/users?after=00u2&limit=200>; rel="next""#;
        assert_eq!(
            parse_link_header(value).as_deref(),
            Some("https://x.okta.com/api/v1/users?after=00u2&limit=200")
        );
        assert_eq!(parse_link_header(r#"<https://a>; rel="self""#), None);
        assert_eq!(parse_link_header("garbage"), None);
    }

    #[test]
    fn test_header_next_link_across_multiple_headers() {
        let mut headers = HeaderMap::new();
        headers.append(LINK, HeaderValue::from_static(r#"<https://a/self>; rel="self""#));
        headers.append(LINK, HeaderValue::from_static(r#"<https://a/next>; rel=next"#));
        assert_eq!(header_next_link(&headers).as_deref(), Some("https://a/next"));
    }

    #[test]
    fn test_body_next_link() {
        let body = json!({"@odata.nextLink": "https://graph/next", "empty": ""});
        assert_eq!(
            body_next_link(&body, "/@odata.nextLink").as_deref(),
            Some("https://graph/next")
        );
        assert_eq!(body_next_link(&body, "/empty"), None);
        assert_eq!(body_next_link(&body, "/missing"), None);
    }
}
