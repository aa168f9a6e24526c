//! Response body templating over captured request data.
//!
//! Templated response bodies can splice fields of the captured request into
//! the reply.
//!
//! # Supported placeholders
//!
//! - `{{.Method}}` - the HTTP method
//! - `{{.Path}}` - the request path
//! - `{{.Query}}` - the raw query string
//! - `{{.Body}}` - the raw request body
//! - `{{.Date}}` - capture time, milliseconds since epoch
//! - `{{.ContentLength}}` - declared body length
//! - `{{.Headers.<Name>}}` - first value of a header (name is
//!   case-insensitive)
//! - `{{.Headers.<Name>.<idx>}}` - indexed header value
//!
//! Unknown placeholders expand to the empty string.

use crate::basket::record::RequestRecord;
use regex::Regex;
use std::sync::OnceLock;

/// Regex for matching placeholders: {{.Method}}, {{.Headers.X-Tag.1}}, etc.
static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_placeholder_regex() -> &'static Regex {
    PLACEHOLDER_REGEX.get_or_init(|| {
        Regex::new(r"\{\{\s*\.([A-Za-z][A-Za-z0-9]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").unwrap()
    })
}

/// Resolve a dotted placeholder path against the captured request.
fn resolve(record: &RequestRecord, path: &str) -> Option<String> {
    let mut parts = path.splitn(2, '.');
    let field = parts.next()?;
    let rest = parts.next();

    match (field, rest) {
        ("Method", None) => Some(record.method.clone()),
        ("Path", None) => Some(record.path.clone()),
        ("Query", None) => Some(record.query.clone()),
        ("Body", None) => Some(record.body.clone()),
        ("Date", None) => Some(record.date.to_string()),
        ("ContentLength", None) => Some(record.content_length.to_string()),
        ("Headers", Some(rest)) => {
            // optional trailing numeric index selects a value beyond the first
            let (name, index) = match rest.rsplit_once('.') {
                Some((name, idx)) => match idx.parse::<usize>() {
                    Ok(i) => (name, i),
                    Err(_) => (rest, 0),
                },
                None => (rest, 0),
            };
            let values = record
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)?;
            values.get(index).cloned()
        }
        _ => None,
    }
}

/// Expand all placeholders in a template against the captured request.
pub fn expand(template: &str, record: &RequestRecord) -> String {
    get_placeholder_regex()
        .replace_all(template, |caps: &regex::Captures| {
            resolve(record, &caps[1]).unwrap_or_default()
        })
        .to_string()
}

/// Check if a string contains any placeholder
pub fn has_placeholders(s: &str) -> bool {
    get_placeholder_regex().is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::{HeaderMap, Method, Uri};

    fn test_record() -> RequestRecord {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json"),
        );
        headers.append(
            HeaderName::from_static("x-tag"),
            HeaderValue::from_static("one"),
        );
        headers.append(
            HeaderName::from_static("x-tag"),
            HeaderValue::from_static("two"),
        );
        let uri: Uri = "/b1/sub?name=John".parse().unwrap();
        RequestRecord::from_parts(
            &Method::POST,
            &uri,
            &headers,
            br#"{"action": "test"}"#,
            1024 * 1024,
        )
    }

    #[test]
    fn test_expand_scalar_fields() {
        let record = test_record();
        assert_eq!(expand("{{.Method}}", &record), "POST");
        assert_eq!(expand("{{.Path}}", &record), "/b1/sub");
        assert_eq!(expand("{{.Query}}", &record), "name=John");
        assert_eq!(expand("{{.Body}}", &record), r#"{"action": "test"}"#);
        assert_eq!(expand("{{.ContentLength}}", &record), "18");
        assert_eq!(expand("{{.Date}}", &record), record.date.to_string());
    }

    #[test]
    fn test_expand_headers() {
        let record = test_record();
        assert_eq!(
            expand("{{.Headers.Content-Type}}", &record),
            "application/json"
        );
        // case-insensitive lookup
        assert_eq!(
            expand("{{.Headers.content-type}}", &record),
            "application/json"
        );
        // indexed access
        assert_eq!(expand("{{.Headers.X-Tag.0}}", &record), "one");
        assert_eq!(expand("{{.Headers.X-Tag.1}}", &record), "two");
        assert_eq!(expand("{{.Headers.X-Tag}}", &record), "one");
    }

    #[test]
    fn test_expand_mixed_template() {
        let record = test_record();
        let template = r#"{"method": "{{.Method}}", "path": "{{.Path}}", "echo": {{.Body}}}"#;
        assert_eq!(
            expand(template, &record),
            r#"{"method": "POST", "path": "/b1/sub", "echo": {"action": "test"}}"#
        );
    }

    #[test]
    fn test_unknown_placeholders_expand_empty() {
        let record = test_record();
        assert_eq!(expand("[{{.Nope}}]", &record), "[]");
        assert_eq!(expand("[{{.Headers.Absent}}]", &record), "[]");
        assert_eq!(expand("[{{.Headers.X-Tag.9}}]", &record), "[]");
    }

    #[test]
    fn test_whitespace_tolerated() {
        let record = test_record();
        assert_eq!(expand("{{ .Method }}", &record), "POST");
    }

    #[test]
    fn test_has_placeholders() {
        assert!(has_placeholders("{{.Method}}"));
        assert!(has_placeholders("x {{.Headers.X-Tag.1}} y"));
        assert!(!has_placeholders("plain text"));
        assert!(!has_placeholders("{{not_a_field}}"));
    }
}
