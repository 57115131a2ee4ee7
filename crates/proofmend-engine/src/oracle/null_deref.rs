use anyhow::{Context, Result};
use proofmend_core::report::is_harness_file;
use proofmend_core::trace::TraceStep;
use proofmend_core::{
    ErrorCluster, FailureCause, OracleRequest, PatchAnchor, Proposal, RepairOracle,
};
use regex::Regex;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::{debug, info};

static NULL_MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^dereference failure: pointer NULL in ([_a-zA-Z][_a-zA-Z0-9]*)->").unwrap()
});
static NULL_STAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^dereference failure: pointer NULL in \*([_a-zA-Z][_a-zA-Z0-9]*)").unwrap()
});
static COPY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\s*(?:\([\w\s\*]+\)\s*)?([-\w>]+);").unwrap());
static ALLOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w+)\s*=\s*(?:\([\w\s\*]+\)\s*)?(\w+)\s*\(.*\);").unwrap()
});
static CALL_ARGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(([^)]*)\)").unwrap());

/// Longest call, in source lines, whose arguments are followed.
const MAX_CALL_LINES: usize = 16;

/// Proposes `__CPROVER_assume(p != NULL);` for NULL dereferences whose
/// pointer can be followed back through the trace to a `malloc` in the
/// harness.
///
/// Only the first request for an error is answered. Once an attempt failed
/// there is nothing else this oracle could suggest.
pub struct NullDerefOracle {
    source_root: PathBuf,
    harness_suffix: String,
}

/// The harness allocation a NULL pointer was traced back to.
#[derive(Debug)]
struct Origin {
    variable: String,
    function: String,
    line: usize,
    text: String,
}

impl NullDerefOracle {
    /// `source_root` is what the verifier's relative file paths resolve
    /// against.
    pub fn new(source_root: impl Into<PathBuf>, harness_suffix: impl Into<String>) -> Self {
        Self {
            source_root: source_root.into(),
            harness_suffix: harness_suffix.into(),
        }
    }

    fn source<'r>(&self, request: &OracleRequest<'r>, file: &str) -> Result<Cow<'r, str>> {
        if is_harness_file(file, &self.harness_suffix) {
            return Ok(Cow::Borrowed(request.harness_source));
        }
        let path = self.source_root.join(file);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Cow::Owned(text))
    }

    fn source_line(
        &self,
        request: &OracleRequest<'_>,
        file: &str,
        line: usize,
    ) -> Result<Option<String>> {
        let Some(index) = line.checked_sub(1) else {
            return Ok(None);
        };
        Ok(self
            .source(request, file)?
            .lines()
            .nth(index)
            .map(str::to_string))
    }

    /// The call starting at `line`, with continuation lines joined until its
    /// parentheses balance.
    fn call_text(
        &self,
        request: &OracleRequest<'_>,
        file: &str,
        line: usize,
    ) -> Result<Option<String>> {
        let Some(index) = line.checked_sub(1) else {
            return Ok(None);
        };
        let source = self.source(request, file)?;
        let mut text = String::new();
        let mut depth = 0i32;
        let mut opened = false;
        for part in source.lines().skip(index).take(MAX_CALL_LINES) {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(part.trim());
            for c in part.chars() {
                match c {
                    '(' => {
                        depth += 1;
                        opened = true;
                    }
                    ')' => depth -= 1,
                    _ => {}
                }
            }
            if opened && depth <= 0 {
                break;
            }
        }
        Ok((!text.is_empty()).then_some(text))
    }

    /// The argument expression bound to the parameter assigned at `index`.
    fn caller_argument(
        &self,
        request: &OracleRequest<'_>,
        steps: &[TraceStep],
        index: usize,
    ) -> Result<Option<(usize, String)>> {
        let mut call = index;
        let mut position = 0usize;
        while steps[call].kind != "function-call" {
            if call == 0 {
                return Ok(None);
            }
            call -= 1;
            position += 1;
        }
        let location = &steps[call].location;
        let (Some(file), Some(line)) = (location.file.as_deref(), location.line_number()) else {
            return Ok(None);
        };
        let Some(text) = self.call_text(request, file, line)? else {
            return Ok(None);
        };
        let argument = CALL_ARGS
            .captures_iter(&text)
            .last()
            .and_then(|caps| {
                caps[1]
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .nth(position.saturating_sub(1))
                    .map(str::to_string)
            });
        Ok(argument.map(|argument| (call, argument)))
    }

    fn trace_origin(
        &self,
        request: &OracleRequest<'_>,
        steps: &[TraceStep],
    ) -> Result<Option<Origin>> {
        let Some((mut index, mut variable)) = locate_failure(request.record.id.as_str(), steps)
        else {
            return Ok(None);
        };
        debug!(index, variable = %variable, "null dereference located");

        while index > 0 {
            let step = &steps[index];
            let lhs = step.detail.get("lhs").and_then(Value::as_str);
            if lhs == Some(variable.as_str()) {
                if step.kind == "parameter-assignment" {
                    let Some((call, argument)) = self.caller_argument(request, steps, index)?
                    else {
                        return Ok(None);
                    };
                    debug!(argument = %argument, "followed parameter to caller");
                    index = call;
                    variable = argument;
                } else if step.kind == "variable-assignment" {
                    let location = &step.location;
                    let (Some(file), Some(line)) =
                        (location.file.as_deref(), location.line_number())
                    else {
                        return Ok(None);
                    };
                    let Some(text) = self.source_line(request, file, line)? else {
                        return Ok(None);
                    };
                    if let Some(caps) = COPY.captures(&text) {
                        variable = caps[1].to_string();
                    } else if let Some(caps) = ALLOCATION.captures(&text) {
                        if &caps[2] != "malloc" || !is_harness_file(file, &self.harness_suffix) {
                            return Ok(None);
                        }
                        return Ok(Some(Origin {
                            variable: caps[1].to_string(),
                            function: location.function.clone().unwrap_or_default(),
                            line,
                            text,
                        }));
                    } else {
                        return Ok(None);
                    }
                }
            }
            index -= 1;
        }
        Ok(None)
    }
}

/// Index of the failing step for `id` and the pointer it dereferenced.
fn locate_failure(id: &str, steps: &[TraceStep]) -> Option<(usize, String)> {
    steps.iter().enumerate().rev().find_map(|(index, step)| {
        if step.detail.get("property").and_then(Value::as_str) != Some(id) {
            return None;
        }
        let reason = step.detail.get("reason").and_then(Value::as_str)?;
        NULL_MEMBER
            .captures(reason)
            .or_else(|| NULL_STAR.captures(reason))
            .map(|caps| (index, caps[1].to_string()))
    })
}

impl RepairOracle for NullDerefOracle {
    fn propose(&self, request: &OracleRequest<'_>) -> Result<Option<Proposal>> {
        if request.record.cluster != ErrorCluster::DerefNull
            || !matches!(request.cause, FailureCause::None)
        {
            return Ok(None);
        }
        let Some(trace) = request.trace else {
            return Ok(None);
        };
        let steps: Vec<TraceStep> =
            serde_json::from_value(trace.clone()).context("Malformed trace steps")?;

        let Some(origin) = self.trace_origin(request, &steps)? else {
            info!(id = %request.record.id, "no precondition suggested");
            return Ok(None);
        };
        info!(
            id = %request.record.id,
            variable = %origin.variable,
            line = origin.line,
            "precondition suggested"
        );

        let code = format!("__CPROVER_assume({} != NULL);", origin.variable);
        Ok(Some(Proposal {
            anchors: vec![PatchAnchor {
                target_function: origin.function,
                previous_line_of_code: origin.text.trim().to_string(),
                next_line_of_code: String::new(),
                code_to_insert: code,
            }],
            response: json!({
                "oracle": "null_deref",
                "variable": origin.variable,
                "line": origin.line,
            }),
            tokens: None,
        }))
    }
}
