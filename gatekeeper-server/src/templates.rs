//! Comment bodies posted when a review stops on an infrastructure failure.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::fmt;
use url::Url;

use crate::operations::RepoRef;

pub const TEMPLATE_FALLBACK: &str = "> [!CAUTION]\n> Failed to load the template for the error message. Please check the gatekeeper logs for more details.";

const GENERAL_API_ERROR: &str = include_str!("templates/general_api_error.md");
const NOT_MERGEABLE: &str = include_str!("templates/not_mergeable.md");
const RETRY_EXCEEDED: &str = include_str!("templates/retry_exceeded.md");
const STATUS_CHECK_FAILED: &str = include_str!("templates/status_check_failed.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    GeneralApiError,
    NotMergeable,
    RetryExceeded,
    StatusCheckFailed,
}

impl TemplateKind {
    pub fn name(&self) -> &'static str {
        match self {
            TemplateKind::GeneralApiError => "general_api_error",
            TemplateKind::NotMergeable => "not_mergeable",
            TemplateKind::RetryExceeded => "retry_exceeded",
            TemplateKind::StatusCheckFailed => "status_check_failed",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, data: &Value) -> Result<String>;
}

/// Render `kind`, falling back to a fixed banner if rendering fails.
pub fn render_or_fallback(
    renderer: &dyn TemplateRenderer,
    kind: TemplateKind,
    data: &Value,
) -> String {
    match renderer.render(kind.name(), data) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("Failed to render template {}: {:#}", kind, e);
            TEMPLATE_FALLBACK.to_string()
        }
    }
}

/// The templates compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinTemplates;

impl BuiltinTemplates {
    fn source(name: &str) -> Option<&'static str> {
        match name {
            "general_api_error" => Some(GENERAL_API_ERROR),
            "not_mergeable" => Some(NOT_MERGEABLE),
            "retry_exceeded" => Some(RETRY_EXCEEDED),
            "status_check_failed" => Some(STATUS_CHECK_FAILED),
            _ => None,
        }
    }
}

impl TemplateRenderer for BuiltinTemplates {
    fn render(&self, name: &str, data: &Value) -> Result<String> {
        let source = Self::source(name).with_context(|| format!("Unknown template {}", name))?;
        substitute(source, data).with_context(|| format!("Failed to render template {}", name))
    }
}

fn is_placeholder(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Replace every `{key}` with the matching value from `data` in one pass.
///
/// Braces around anything that is not a placeholder name are left alone.
/// Substituted values are never rescanned.
pub fn substitute(template: &str, data: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder(&after[..close]) => {
                let key = &after[..close];
                let value = data
                    .get(key)
                    .ok_or_else(|| anyhow!("Missing template value {}", key))?;
                match value {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Backslash-escape Markdown control characters.
pub fn escape_markdown(text: &str) -> String {
    const SPECIAL: &str = "\\`*_{}[]()#+-.!";
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Deep link into the log search UI covering two hours either side of `now`.
pub fn log_search_url(
    base: &str,
    repo: &RepoRef,
    number: u64,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid log search URL {}", base))?;

    let mut terms = vec![
        format!("@github_pr_num:{}", number),
        format!("@github_repository_name:{}", repo.name),
        "service:gatekeeper".to_string(),
    ];
    terms.sort();

    let window = Duration::hours(2);
    url.query_pairs_mut()
        .append_pair("query", &terms.join(" "))
        .append_pair("from_ts", &(now - window).timestamp_millis().to_string())
        .append_pair("to_ts", &(now + window).timestamp_millis().to_string());

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    struct Broken;

    impl TemplateRenderer for Broken {
        fn render(&self, _name: &str, _data: &Value) -> Result<String> {
            Err(anyhow!("template store unavailable"))
        }
    }

    #[test]
    fn test_substitute_replaces_placeholders() {
        let rendered = substitute("{a} and {b_2}", &json!({"a": "x", "b_2": 3})).unwrap();
        assert_eq!(rendered, "x and 3");
    }

    #[test]
    fn test_substitute_is_single_pass() {
        let rendered = substitute("{a}", &json!({"a": "{b}", "b": "nope"})).unwrap();
        assert_eq!(rendered, "{b}");
    }

    #[test]
    fn test_substitute_leaves_non_placeholders() {
        let rendered = substitute("fn x() { y } {", &json!({})).unwrap();
        assert_eq!(rendered, "fn x() { y } {");
    }

    #[test]
    fn test_substitute_missing_value_is_an_error() {
        let err = substitute("{missing}", &json!({})).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_builtin_templates_render() {
        let data = json!({
            "step": "approve",
            "error": "GitHub API error: 502 - bad gateway",
            "stack": "0: gatekeeper",
            "log_url": "https://logs.example.com",
            "name": "status checks",
            "attempts": 4,
            "elapsed": "10m0s",
            "message": "Combined status is failure",
        });
        for kind in [
            TemplateKind::GeneralApiError,
            TemplateKind::NotMergeable,
            TemplateKind::RetryExceeded,
            TemplateKind::StatusCheckFailed,
        ] {
            let body = BuiltinTemplates.render(kind.name(), &data).unwrap();
            assert!(body.contains("https://logs.example.com"), "{}", kind);
            assert!(body.contains("0: gatekeeper"), "{}", kind);
        }

        let body = BuiltinTemplates.render("retry_exceeded", &data).unwrap();
        assert!(body.contains("after 4 attempts (10m0s)"));
    }

    #[test]
    fn test_unknown_template_is_an_error() {
        assert!(BuiltinTemplates.render("nope", &json!({})).is_err());
    }

    #[test]
    fn test_render_failure_falls_back_to_banner() {
        let body = render_or_fallback(&Broken, TemplateKind::NotMergeable, &json!({}));
        assert_eq!(body, TEMPLATE_FALLBACK);

        let body = render_or_fallback(&BuiltinTemplates, TemplateKind::NotMergeable, &json!({}));
        assert_eq!(body, TEMPLATE_FALLBACK);
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("a_b *c*"), "a\\_b \\*c\\*");
        assert_eq!(escape_markdown("[x](y)"), "\\[x\\]\\(y\\)");
        assert_eq!(escape_markdown("plain text"), "plain text");
    }

    #[test]
    fn test_log_search_url() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let url = log_search_url(
            "https://logs.example.com/search",
            &RepoRef::new("octo", "hello"),
            42,
            now,
        )
        .unwrap();

        let parsed = Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs["query"],
            "@github_pr_num:42 @github_repository_name:hello service:gatekeeper"
        );
        assert_eq!(
            pairs["from_ts"],
            (now - Duration::hours(2)).timestamp_millis().to_string()
        );
        assert_eq!(
            pairs["to_ts"],
            (now + Duration::hours(2)).timestamp_millis().to_string()
        );
    }

    #[test]
    fn test_log_search_url_rejects_garbage() {
        assert!(log_search_url("not a url", &RepoRef::new("o", "r"), 1, Utc::now()).is_err());
    }
}
