//! Jira wiki markup to GitLab flavored markdown.
//!
//! A best-effort textual transform: it covers the notation people actually
//! use in tickets and leaves anything it does not recognise untouched.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

static LINE_BREAK: Lazy<Regex> = Lazy::new(|| re(r"(\r?\n)"));

/// Applied in order, after tables and line breaks.
static RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        // code and preformatted blocks
        (re(r"\{code\}\s*"), "\n```\n"),
        (re(r"\{code:(\w+)(?:\|\w+=[\w.\-]+)*\}\s*"), "\n```$1\n"),
        (re(r"\{code:[^}]*\}\s*"), "\n```\n"),
        (re(r"\{noformat\}\s*"), "\n```\n"),
        // quotes, colors, rulers
        (re(r"(?m)^[ \t]*bq\. (.*)$"), "> $1"),
        (re(r"\{quote\}"), "\n>>>\n"),
        (re(r"\{color:[#\w]+\}(.*?)\{color\}"), "**$1**"),
        (re(r"(?m)^-{4,}[ \t]*$"), "---"),
        // mentions and links
        (re(r"\[~([\w.\-@]+)\]"), "@$1"),
        (re(r"\[([^|\]\[]*)\]"), "$1"),
        (re(r"\[([^|\]]+)\|([a-z]+://[^\]]+)\]"), "[$1]($2)"),
        // lists, deepest levels first
        (re(r"(?m)^ *[*\-#]{2}# "), "     1. "),
        (re(r"(?m)^ *[*\-#]# "), "   1. "),
        (re(r"(?m)^ *# "), "1. "),
        (re(r"(?m)^ *[*\-#]{2}[*\-] "), "     - "),
        (re(r"(?m)^ *[*\-#][*\-] "), "   - "),
        (re(r"(?m)^ *\* "), "- "),
        // text effects
        (re(r"(^|\W)\{\{([^}]*)\}\}(\W|$)"), "$1`$2`$3"),
        (re(r"(^|\W)\*(\S|\S.*?\S)\*(\W|$)"), "$1**$2**$3"),
        (re(r"(^|\W)_(\S|\S.*?\S)_(\W|$)"), "$1*$2*$3"),
        (re(r"(^|\W)-([^\s\-|]|[^\s\-|].*?[^\s\-|])-(\W|$)"), "$1~~$2~~$3"),
        (re(r"(^|\W)\+(\S|\S.*?\S)\+(\W|$)"), "$1<ins>$2</ins>$3"),
    ]
});

static HEADING: Lazy<Regex> = Lazy::new(|| re(r"(?m)^[ \t]*h([1-6])\.\s+"));

const EMOTICONS: &[(&str, &str)] = &[
    (":)", ":smiley:"),
    (":(", ":disappointed:"),
    (":P", ":yum:"),
    (":D", ":grin:"),
    (";)", ":wink:"),
    ("(y)", ":thumbsup:"),
    ("(n)", ":thumbsdown:"),
    ("(i)", ":information_source:"),
    ("(/)", ":white_check_mark:"),
    ("(x)", ":x:"),
    ("(!)", ":warning:"),
    ("(+)", ":heavy_plus_sign:"),
    ("(-)", ":heavy_minus_sign:"),
    ("(?)", ":grey_question:"),
    ("(on)", ":bulb:"),
    ("(*)", ":star:"),
    ("(*r)", ":star:"),
    ("(*g)", ":star:"),
    ("(*b)", ":star:"),
    ("(*y)", ":star:"),
];

/// Convert a Jira wiki text. Bare issue keys of `project_key` become links
/// to the issue on `source_url`.
pub fn to_markdown(
    text: &str,
    project_key: &str,
    source_url: &str,
    repair_tables: bool,
) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let mut t = tables_to_markdown(text, repair_tables);
    t = LINE_BREAK.replace_all(&t, "  $1").into_owned();
    for (pattern, replacement) in RULES.iter() {
        t = pattern.replace_all(&t, *replacement).into_owned();
    }
    t = HEADING
        .replace_all(&t, |caps: &Captures| {
            let level: usize = caps[1].parse().unwrap_or(1);
            format!("{} ", "#".repeat(level))
        })
        .into_owned();

    if !project_key.is_empty() {
        let keys = Regex::new(&format!(r"\b({}-\d+)\b", regex::escape(project_key)));
        if let Ok(keys) = keys {
            let base = source_url.trim_end_matches('/');
            t = keys
                .replace_all(&t, |caps: &Captures| {
                    format!("[{key}]({base}/browse/{key})", key = &caps[1])
                })
                .into_owned();
        }
    }

    for (emoticon, code) in EMOTICONS {
        t = t.replace(emoticon, code);
    }
    t
}

/// Rows broken by in-cell newlines are joined back with `<br>`. `||a||b||`
/// header rows become markdown headers with a separator row; regular `|x|y|`
/// rows are already valid markdown. With `repair`, a table without a header
/// row gets a separator after its first row, and a row that never closes is
/// kept joined instead of leaving the text untouched.
fn tables_to_markdown(text: &str, repair: bool) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut rows: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let mut row = lines[i].trim_end().to_string();
        if row.starts_with('|') {
            while !row.ends_with('|') && i + 1 < lines.len() {
                i += 1;
                row.push_str("<br>");
                row.push_str(lines[i].trim_end());
            }
            if !row.ends_with('|') && !repair {
                return text.to_string();
            }
        }
        rows.push(row);
        i += 1;
    }

    let mut out: Vec<String> = Vec::with_capacity(rows.len() + 1);
    let mut found_header = false;
    for row in rows {
        if row.len() > 4 && row.starts_with("||") && row.ends_with("||") {
            found_header = true;
            let cells: Vec<&str> = row[2..row.len() - 2].split("||").collect();
            out.push(format!("|{}|", cells.join("|")));
            out.push(format!("|{}", " --- |".repeat(cells.len())));
        } else {
            out.push(row);
        }
    }

    if repair && !found_header {
        let first_row = out
            .iter()
            .position(|l| l.len() > 1 && l.starts_with('|') && l.ends_with('|'));
        if let Some(index) = first_row {
            let cells = out[index].trim_matches('|').split('|').count();
            out.insert(index + 1, format!("|{}", " --- |".repeat(cells)));
        }
    }

    let mut joined = out.join("\n");
    if text.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

/// Point attachment embeds (`!name.png|thumbnail!`, `[^name.pdf]`) at the
/// uploaded copies.
pub fn replace_attachments(text: &str, attachments: &[(String, String)]) -> String {
    let mut t = text.to_string();
    for (filename, url) in attachments {
        let escaped = regex::escape(filename);
        if let Ok(embed) = Regex::new(&format!(r"!{escaped}[^!\n]*!")) {
            t = embed
                .replace_all(&t, |_: &Captures| format!("![{filename}]({url})"))
                .into_owned();
        }
        if let Ok(link) = Regex::new(&format!(r"\[\^{escaped}\]")) {
            t = link
                .replace_all(&t, |_: &Captures| format!("[{filename}]({url})"))
                .into_owned();
        }
    }
    t
}
