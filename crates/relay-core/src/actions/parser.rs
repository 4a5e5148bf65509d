//! Tokenizer for tagged requests in model output.
//!
//! Recognizes `<name attr="v" …>content</name>` and `<name attr="v" …/>`.
//! It knows nothing about which names exist; the registry decides that.
//! An opening tag with no matching close tag is ignored, so stray markup in
//! prose does not turn into a request.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<([a-z][a-z0-9_]*)((?:\s+[A-Za-z_][\w-]*\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/?)>"#,
    )
    .expect("open tag pattern is valid")
});

static ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attr pattern is valid")
});

/// One request as written by the model, before any typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAction {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub content: Option<String>,
}

/// Extract all tagged requests from `text`, in order of appearance.
pub fn parse_actions(text: &str) -> Vec<ParsedAction> {
    let mut actions = Vec::new();
    let mut pos = 0;

    while let Some(caps) = OPEN_TAG.captures_at(text, pos) {
        let Some(whole) = caps.get(0) else { break };
        let name = &caps[1];
        let attrs = parse_attrs(caps.get(2).map_or("", |m| m.as_str()));
        let self_closing = !caps[3].is_empty();

        if self_closing {
            actions.push(ParsedAction {
                name: name.to_string(),
                attrs,
                content: None,
            });
            pos = whole.end();
            continue;
        }

        let close = format!("</{name}>");
        match text[whole.end()..].find(&close) {
            Some(offset) => {
                let body = &text[whole.end()..whole.end() + offset];
                let body = unescape(body.trim());
                actions.push(ParsedAction {
                    name: name.to_string(),
                    attrs,
                    content: (!body.is_empty()).then_some(body),
                });
                pos = whole.end() + offset + close.len();
            }
            None => pos = whole.end(),
        }
    }
    actions
}

fn parse_attrs(raw: &str) -> BTreeMap<String, String> {
    ATTR.captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str());
            (caps[1].to_string(), unescape(value))
        })
        .collect()
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
