//! Struct-literal codec
//!
//! Converts the verifier's C-like struct/array literals
//! (`{ .len = 4u, .data = { 1, 2 }, .next = ((struct node *)NULL) }`) into a
//! `serde_json::Value` tree and writes trees back as literal text.
//!
//! Decoding is a fixed sequence of rewrite stages followed by a strict JSON
//! parse. Every stage is a pure `&str -> String` function so it can be tested
//! on its own. A literal the stages do not understand ends up as invalid JSON
//! and decoding fails with [`CodecError`]; nothing is guessed.

use crate::error::CodecError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

const NULL_FORM: &str =
    r"(?:\(\([^)]+(?:\(\*\)\([^()]*\))?\)\s*)?\bNULL\b\)?(?: \+ \d+)?";

static INT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d+)(?:[uU](?:[lL]{1,2})?|[lL]{1,2}[uU]?)\b").unwrap()
});
static NULL_POINTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("({})", NULL_FORM)).unwrap());
static NULL_POINTER_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{}$", NULL_FORM)).unwrap());
static INVALID_POINTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bINVALID(?:-\d+)?\b").unwrap());
static ENUM_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\*enum\*/([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static OBJECT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(&[A-Za-z0-9_$.]+)").unwrap());
static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.([$A-Za-z_][$A-Za-z0-9_]*)\s*=").unwrap());
static BOOLEAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(TRUE|FALSE)\b").unwrap());
static ENUM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static OBJECT_REF_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^&[A-Za-z0-9_$.]+$").unwrap());
static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+[uUlL]*$").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Decode a verifier literal into a structured value.
pub fn decode(literal: &str) -> Result<Value, CodecError> {
    let rewritten = rewrite(literal);
    serde_json::from_str(&rewritten).map_err(|source| CodecError {
        literal: literal.to_string(),
        rewritten,
        source,
    })
}

/// Run every rewrite stage, producing the text handed to the JSON parser.
pub fn rewrite(literal: &str) -> String {
    let text = strip_newlines(literal);
    let text = char_literals_to_codes(&text);
    let text = strip_integer_suffixes(&text);
    let text = quote_sentinels(&text);
    let text = classify_braces(&text);
    let text = quote_field_names(&text);
    lower_booleans(&text)
}

/// Encode a value as literal text, collapsed onto one line.
pub fn to_source(value: &Value) -> String {
    WHITESPACE.replace_all(&encode(value), " ").into_owned()
}

/// Encode a value using the verifier's literal grammar.
pub fn encode(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => encode_string(s),
        Value::Array(items) => {
            if items.is_empty() {
                return "{ }".to_string();
            }
            let parts: Vec<String> = items.iter().map(encode).collect();
            format!("{{ {} }}", parts.join(", "))
        }
        Value::Object(fields) => {
            if fields.is_empty() {
                return "{ }".to_string();
            }
            let parts: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!(".{} = {}", key, encode(value)))
                .collect();
            format!("{{ {} }}", parts.join(", "))
        }
    }
}

fn encode_string(s: &str) -> String {
    if NULL_POINTER_EXACT.is_match(s) || OBJECT_REF_EXACT.is_match(s) || INTEGER.is_match(s) {
        s.to_string()
    } else if ENUM_NAME.is_match(s) {
        format!("/*enum*/{}", s)
    } else {
        serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
    }
}

/// Whether a raw trace value needs the codec at all.
pub fn is_aggregate(text: &str) -> bool {
    text.contains('{')
}

// ═══════════════════════════════════════════════════════════════════════════
//  REWRITE STAGES
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn strip_newlines(text: &str) -> String {
    text.replace(['\n', '\r'], "")
}

/// `'a'` → `97`, `'\n'` → `10`. Double-quoted strings are left alone.
pub(crate) fn char_literals_to_codes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(next) = chars.get(i + 1) {
                    out.push(*next);
                    i += 2;
                    continue;
                }
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == '\'' {
            if let Some((code, width)) = parse_char_literal(&chars[i..]) {
                out.push_str(&code.to_string());
                i += width;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

fn parse_char_literal(chars: &[char]) -> Option<(u32, usize)> {
    match *chars.get(1)? {
        '\\' => {
            let (code, len) = match *chars.get(2)? {
                'n' => (10, 1),
                't' => (9, 1),
                'r' => (13, 1),
                'a' => (7, 1),
                'b' => (8, 1),
                'f' => (12, 1),
                'v' => (11, 1),
                '\\' => (92, 1),
                '\'' => (39, 1),
                '"' => (34, 1),
                '?' => (63, 1),
                'x' => {
                    let digits: String = chars[3..]
                        .iter()
                        .take_while(|c| c.is_ascii_hexdigit())
                        .collect();
                    (u32::from_str_radix(&digits, 16).ok()?, 1 + digits.len())
                }
                d if d.is_digit(8) => {
                    let digits: String = chars[2..]
                        .iter()
                        .take(3)
                        .take_while(|c| c.is_digit(8))
                        .collect();
                    (u32::from_str_radix(&digits, 8).ok()?, digits.len())
                }
                _ => return None,
            };
            (*chars.get(2 + len)? == '\'').then_some((code, 3 + len))
        }
        '\'' => None,
        c => (*chars.get(2)? == '\'').then_some((c as u32, 3)),
    }
}

/// `4u` → `4`, `7ull` → `7`.
pub(crate) fn strip_integer_suffixes(text: &str) -> String {
    rewrite_unquoted(text, |segment| {
        INT_SUFFIX.replace_all(segment, "$1").into_owned()
    })
}

/// Quote enum tags, pointer sentinels and object references so they parse as
/// JSON strings. `INVALID-n` pointers are treated as `NULL`.
pub(crate) fn quote_sentinels(text: &str) -> String {
    let text = rewrite_unquoted(text, |segment| {
        ENUM_TAG.replace_all(segment, "\"$1\"").into_owned()
    });
    let text = rewrite_unquoted(&text, |segment| {
        NULL_POINTER.replace_all(segment, "\"$1\"").into_owned()
    });
    let text = rewrite_unquoted(&text, |segment| {
        INVALID_POINTER.replace_all(segment, "\"NULL\"").into_owned()
    });
    rewrite_unquoted(&text, |segment| {
        OBJECT_REF.replace_all(segment, "\"$1\"").into_owned()
    })
}

/// Decide per `{` whether it opens a struct (`.field = ...` or empty) or an
/// array (anything else), by peeking at the next non-whitespace character.
/// Unbalanced braces are copied through and rejected by the JSON parse.
pub(crate) fn classify_braces(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut open_is_array: Vec<bool> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                let is_array = !matches!(next, Some('.') | Some('}'));
                open_is_array.push(is_array);
                out.push(if is_array { '[' } else { '{' });
            }
            '}' => match open_is_array.pop() {
                Some(true) => out.push(']'),
                _ => out.push('}'),
            },
            _ => out.push(c),
        }
    }
    out
}

/// `.field =` → `"field":`
pub(crate) fn quote_field_names(text: &str) -> String {
    rewrite_unquoted(text, |segment| {
        FIELD_NAME.replace_all(segment, "\"${1}\":").into_owned()
    })
}

pub(crate) fn lower_booleans(text: &str) -> String {
    rewrite_unquoted(text, |segment| {
        BOOLEAN
            .replace_all(segment, |caps: &regex::Captures| {
                if &caps[1] == "TRUE" {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            })
            .into_owned()
    })
}

/// Apply `f` to every stretch of text outside double-quoted strings.
fn rewrite_unquoted(text: &str, f: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut segment_start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                out.push_str(&text[segment_start..=i]);
                segment_start = i + 1;
            }
            continue;
        }
        if c == '"' {
            out.push_str(&f(&text[segment_start..i]));
            in_string = true;
            segment_start = i;
        }
    }

    if in_string {
        out.push_str(&text[segment_start..]);
    } else {
        out.push_str(&f(&text[segment_start..]));
    }
    out
}

/// Build a JSON object from key/value pairs. Test and fixture helper.
pub fn object<I, K>(pairs: I) -> Value
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let map: Map<String, Value> = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
    Value::Object(map)
}
