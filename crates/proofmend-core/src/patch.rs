//! Anchor-based single-line insertion into harness source.
//!
//! Edits are located by the text of neighbouring lines inside the target
//! function, never by line number. Matching ignores spaces and is a substring
//! test, so `if(p==NULL)` matches `    if (p == NULL) {`.

use crate::error::InsertError;
use crate::ledger::LineLedger;
use crate::protocol::PatchAnchor;
use regex::Regex;

const FUNCTION_MODEL_TAG: &str = "(function model)";

/// A successful insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    pub text: String,
    /// 1-based line of the inserted code in `text`.
    pub line: usize,
    /// `code @ function:line`
    pub description: String,
}

fn normalize(line: &str) -> String {
    line.replace(' ', "").trim().to_string()
}

fn target_name(anchor: &PatchAnchor) -> String {
    anchor
        .target_function
        .replace(FUNCTION_MODEL_TAG, "")
        .trim()
        .to_string()
}

/// Net `{`/`}` count outside string and char literals and `//` comments.
fn brace_delta(line: &str) -> i64 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '/' if chars.peek() == Some(&'/') => break,
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// Whether a `{` follows line `start` before any `;`, i.e. the signature
/// there is a definition rather than a prototype or a call.
fn opens_body(lines: &[&str], start: usize) -> bool {
    for line in &lines[start..] {
        let code = line.split("//").next().unwrap_or_default();
        for c in code.chars() {
            match c {
                '{' => return true,
                ';' => return false,
                _ => {}
            }
        }
    }
    false
}

/// Index range (0-based, inclusive) of the lines making up the definition of
/// `function`.
fn function_span(lines: &[&str], function: &str) -> Option<(usize, usize)> {
    let entry = Regex::new(&format!(
        r"^\s*[a-zA-Z_][a-zA-Z0-9_\s\*]*\b{}\s*\(",
        regex::escape(function)
    ))
    .ok()?;
    let start = (0..lines.len()).find(|&idx| {
        entry.is_match(lines[idx])
            && !lines[idx].trim_start().starts_with("return")
            && opens_body(lines, idx)
    })?;

    let mut depth = 0i64;
    let mut opened = false;
    for (idx, line) in lines.iter().enumerate().skip(start) {
        depth += brace_delta(line);
        if depth > 0 {
            opened = true;
        }
        if opened && depth <= 0 {
            return Some((start, idx));
        }
    }
    Some((start, lines.len().saturating_sub(1)))
}

fn find_anchor(lines: &[&str], span: (usize, usize), anchor: &str) -> Option<usize> {
    let needle = normalize(anchor);
    if needle.is_empty() {
        return None;
    }
    (span.0..=span.1).find(|&idx| normalize(lines[idx]).contains(&needle))
}

fn indentation(line: &str) -> &str {
    let trimmed = line.trim_start();
    &line[..line.len() - trimmed.len()]
}

/// Insert `anchor.code_to_insert` after the previous-line anchor, or before
/// the next-line anchor when the previous one is not in the function.
pub fn insert_into(source: &str, anchor: &PatchAnchor) -> Result<Insertion, InsertError> {
    let function = target_name(anchor);
    let not_found = || InsertError {
        previous_line: anchor.previous_line_of_code.clone(),
        next_line: anchor.next_line_of_code.clone(),
        function: function.clone(),
    };

    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let bare: Vec<&str> = lines
        .iter()
        .map(|l| l.trim_end_matches(['\n', '\r']))
        .collect();
    let span = function_span(&bare, &function).ok_or_else(not_found)?;

    let (insert_at, indent_from) =
        if let Some(idx) = find_anchor(&bare, span, &anchor.previous_line_of_code) {
            (idx + 1, idx)
        } else if let Some(idx) = find_anchor(&bare, span, &anchor.next_line_of_code) {
            (idx, idx)
        } else {
            return Err(not_found());
        };

    let code = anchor.code_to_insert.trim();
    let new_line = format!("{}{}\n", indentation(bare[indent_from]), code);

    let mut text = String::with_capacity(source.len() + new_line.len());
    for (idx, line) in lines.iter().enumerate() {
        if idx == insert_at {
            text.push_str(&new_line);
        }
        text.push_str(line);
        if idx + 1 == insert_at && !line.ends_with('\n') {
            text.push('\n');
        }
    }
    if insert_at == lines.len() {
        text.push_str(&new_line);
    }

    let line = insert_at + 1;
    Ok(Insertion {
        text,
        line,
        description: format!("{} @ {}:{}", code, function, line),
    })
}

/// Apply anchors in order, recording each insertion in `ledger`. On the first
/// miss nothing is returned and `ledger` is left as it was.
pub fn insert_all(
    source: &str,
    anchors: &[PatchAnchor],
    ledger: &mut LineLedger,
) -> Result<(String, Vec<Insertion>), InsertError> {
    let mut trial = ledger.clone();
    let mut text = source.to_string();
    let mut applied = Vec::with_capacity(anchors.len());
    for anchor in anchors {
        let insertion = insert_into(&text, anchor)?;
        trial.record_insertion(insertion.line);
        text = insertion.text.clone();
        applied.push(insertion);
    }
    *ledger = trial;
    Ok((text, applied))
}
