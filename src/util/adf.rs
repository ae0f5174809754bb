use serde_json::Value;

/// Text of a Jira field that is either wiki markup (REST v2, Server) or an
/// Atlassian Document Format tree (REST v3, Cloud).
pub fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => adf_to_text(other).filter(|t| !t.trim().is_empty()),
    }
}

/// Flatten an ADF document. Block nodes become lines, hard breaks become
/// newlines, and mentions keep the `[~user]` notation so markup translation
/// can turn them into destination mentions.
pub fn adf_to_text(value: &Value) -> Option<String> {
    let mut out = String::new();
    walk(value, &mut out);
    let text = out.trim_end().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn walk(value: &Value, out: &mut String) {
    match value {
        Value::Array(nodes) => nodes.iter().for_each(|n| walk(n, out)),
        Value::Object(obj) => {
            let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
            match kind {
                "text" => {
                    if let Some(text) = obj.get("text").and_then(Value::as_str) {
                        out.push_str(text);
                    }
                }
                "hardBreak" => out.push('\n'),
                "mention" => {
                    let attrs = obj.get("attrs");
                    let id = attrs
                        .and_then(|a| a.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    out.push_str(&format!("[~{id}]"));
                }
                _ => {
                    if let Some(content) = obj.get("content") {
                        walk(content, out);
                    }
                    if matches!(
                        kind,
                        "paragraph" | "heading" | "listItem" | "codeBlock" | "blockquote" | "rule"
                    ) && !out.ends_with('\n')
                    {
                        out.push('\n');
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wiki_strings_pass_through() {
        assert_eq!(field_text(&json!("h1. Title")).as_deref(), Some("h1. Title"));
        assert_eq!(field_text(&Value::Null), None);
    }

    #[test]
    fn adf_paragraphs_become_lines() {
        let doc = json!({
            "type": "doc",
            "content": [
                {"type": "paragraph", "content": [
                    {"type": "text", "text": "Hello "},
                    {"type": "mention", "attrs": {"id": "jdoe"}}
                ]},
                {"type": "paragraph", "content": [
                    {"type": "text", "text": "line one"},
                    {"type": "hardBreak"},
                    {"type": "text", "text": "line two"}
                ]}
            ]
        });
        assert_eq!(
            field_text(&doc).as_deref(),
            Some("Hello [~jdoe]\nline one\nline two")
        );
    }

    #[test]
    fn empty_document_is_none() {
        assert_eq!(field_text(&json!({"type": "doc", "content": []})), None);
    }
}
