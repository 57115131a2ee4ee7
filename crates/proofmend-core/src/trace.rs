//! Trace analysis
//!
//! For each error we rebuild two things from the verifier's traces:
//! the values of harness and global variables at the failure point (from
//! `viewer-trace.json`), and the call stack from the failure up to the
//! harness entry (from the per-error HTML trace page).

use crate::codec;
use crate::error::StructureError;
use crate::record::{ErrorRecord, ScopedVars, StackFrame};
use crate::report::{is_harness_file, normalized_text};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::trace;

const TRACE_DOCUMENT: &str = "viewer-trace";
const TRACE_PAGE: &str = "trace page";
pub const GLOBAL_SCOPE: &str = "global";

static CBMC: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.cbmc").unwrap());
static FUNCTION_CALL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.function-call").unwrap());
static HEADER: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.header").unwrap());
static STEP: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".step").unwrap());
static CBMC_ANY: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".cbmc").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

static CALL_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Step \d+: Function (.*), File (.*), Line (\w+)").unwrap());
static CALLER_SOURCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?:\.+/)?(.*\.c)").unwrap());
static INDEXED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d+)\]").unwrap());

/// Symbol name to the trace-page href where it first appeared.
pub type SymbolIndex = BTreeMap<String, String>;

/// `viewer-trace.traces`, keyed by error id.
#[derive(Debug, Clone, Default)]
pub struct TraceDocument {
    traces: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceStep {
    pub kind: String,
    #[serde(default)]
    pub location: StepLocation,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepLocation {
    pub function: Option<String>,
    pub file: Option<String>,
    #[serde(default)]
    pub line: Value,
}

impl StepLocation {
    pub fn line_number(&self) -> Option<usize> {
        match &self.line {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Assignment {
    pub lhs: String,
    #[serde(default)]
    pub lhs_lexical_scope: String,
    pub rhs_value: String,
}

impl TraceStep {
    pub fn is_assignment(&self) -> bool {
        self.kind == "variable-assignment"
    }

    pub fn assignment(&self) -> Result<Assignment, StructureError> {
        serde_json::from_value(self.detail.clone()).map_err(|source| StructureError::Json {
            document: TRACE_DOCUMENT,
            source,
        })
    }
}

impl TraceDocument {
    pub fn parse(json: &str) -> Result<Self, StructureError> {
        let value: Value = serde_json::from_str(json).map_err(|source| StructureError::Json {
            document: TRACE_DOCUMENT,
            source,
        })?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> Result<Self, StructureError> {
        let traces = value
            .get_mut("viewer-trace")
            .and_then(|v| v.get_mut("traces"))
            .map(Value::take)
            .ok_or_else(|| StructureError::Missing {
                document: TRACE_DOCUMENT,
                what: "viewer-trace.traces".to_string(),
            })?;
        match traces {
            Value::Object(traces) => Ok(Self { traces }),
            other => Err(StructureError::Unexpected {
                document: TRACE_DOCUMENT,
                context: "traces must be an object",
                found: other.to_string(),
            }),
        }
    }

    pub fn raw(&self, id: &str) -> Option<&Value> {
        self.traces.get(id)
    }

    pub fn steps(&self, id: &str) -> Result<Vec<TraceStep>, StructureError> {
        let raw = self.raw(id).ok_or_else(|| StructureError::MissingTrace {
            id: id.to_string(),
        })?;
        serde_json::from_value(raw.clone()).map_err(|source| StructureError::Json {
            document: TRACE_DOCUMENT,
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

pub struct TraceAnalyzer {
    harness_suffix: String,
}

impl TraceAnalyzer {
    pub fn new(harness_suffix: impl Into<String>) -> Self {
        Self {
            harness_suffix: harness_suffix.into(),
        }
    }

    /// Fill in `vars` and `stack` for a parsed error and record any symbols
    /// its trace page references.
    pub fn analyze(
        &self,
        record: &mut ErrorRecord,
        traces: &TraceDocument,
        page_html: &str,
        symbols: &mut SymbolIndex,
    ) -> Result<(), StructureError> {
        let steps = traces.steps(record.id.as_str())?;
        record.vars = self.scoped_vars(&steps)?;

        let page = Html::parse_document(page_html);
        collect_symbols(&page, symbols);
        record.stack = call_stack(&page, record)?;
        Ok(())
    }

    /// Variable values at the end of the trace, per function scope.
    pub fn scoped_vars(&self, steps: &[TraceStep]) -> Result<ScopedVars, StructureError> {
        let mut scopes: BTreeMap<String, Value> = BTreeMap::new();

        for step in steps {
            if !step.is_assignment() || !self.in_scope(step) {
                continue;
            }
            let function = step.location.function.as_deref();
            if matches!(function, Some("malloc") | Some("memcpy")) {
                continue;
            }
            let assignment = step.assignment()?;

            let mut root = assignment
                .lhs_lexical_scope
                .rsplit("::")
                .next()
                .unwrap_or_default()
                .to_string();
            if root.starts_with("tmp_if_expr") {
                continue;
            }
            if root.starts_with("dynamic_object") {
                root = format!("&{}", root);
            }

            let mut lhs = assignment.lhs.clone();
            if lhs.contains("return_value") {
                continue;
            }
            if lhs.starts_with("dynamic_object") {
                lhs = format!("&{}", lhs);
            }

            let value = read_value(&assignment.rhs_value)?;
            let scope = function.unwrap_or(GLOBAL_SCOPE);
            trace!(scope, lhs = %lhs, "assignment");

            let global_has = |scopes: &BTreeMap<String, Value>, name: &str| {
                scopes
                    .get(GLOBAL_SCOPE)
                    .and_then(Value::as_object)
                    .is_some_and(|g| g.contains_key(name))
            };

            if root != lhs {
                let keys: Vec<&str> = lhs.split('.').collect();
                let base = INDEXED.replace_all(keys[0], "");
                let target = if global_has(&scopes, &base) {
                    GLOBAL_SCOPE
                } else {
                    scope
                };
                let slot = scopes
                    .entry(target.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                write_path(slot, &keys, value);
            } else if global_has(&scopes, &root) {
                if let Some(global) = scopes.get_mut(GLOBAL_SCOPE).and_then(Value::as_object_mut) {
                    global.insert(root, value);
                }
            } else if let Some(vars) = scopes
                .entry(scope.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
            {
                vars.entry(root).or_insert(value);
            }
        }

        Ok(scopes
            .into_iter()
            .filter_map(|(scope, vars)| match vars {
                Value::Object(vars) if !vars.is_empty() => Some((
                    scope,
                    vars.iter().map(|(k, v)| (k.clone(), render(v))).collect(),
                )),
                _ => None,
            })
            .collect())
    }

    fn in_scope(&self, step: &TraceStep) -> bool {
        step.location.function.is_none()
            || step
                .location
                .file
                .as_deref()
                .is_some_and(|f| is_harness_file(f, &self.harness_suffix))
    }
}

fn read_value(rhs: &str) -> Result<Value, StructureError> {
    if codec::is_aggregate(rhs) {
        Ok(codec::decode(rhs)?)
    } else if rhs.starts_with("dynamic_object") {
        Ok(Value::String(format!("&{}", rhs)))
    } else {
        Ok(Value::String(rhs.to_string()))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => codec::to_source(value),
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// `buf[2][3]` → `("buf", [2, 3])`
fn split_indices(key: &str) -> (&str, Vec<usize>) {
    let name_end = key.find('[').unwrap_or(key.len());
    let indices = INDEXED
        .captures_iter(&key[name_end..])
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    (&key[..name_end], indices)
}

/// Write `value` at a dotted/indexed path, creating containers on the way.
fn write_path(target: &mut Value, keys: &[&str], value: Value) {
    let Some((head, rest)) = keys.split_first() else {
        *target = value;
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Some(object) = target.as_object_mut() else {
        return;
    };
    let (name, indices) = split_indices(head);
    let mut slot = object.entry(name.to_string()).or_insert(Value::Null);
    for index in indices {
        let Some(next) = array_slot(slot, index) else {
            return;
        };
        slot = next;
    }
    write_path(slot, rest, value);
}

fn array_slot(slot: &mut Value, index: usize) -> Option<&mut Value> {
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    let items = slot.as_array_mut()?;
    if items.len() <= index {
        items.resize(index + 1, Value::Null);
    }
    items.get_mut(index)
}

/// Call stack from the failure site outwards. For builtin errors without a
/// file, the caller's source file is taken from the first call header.
pub fn call_stack(page: &Html, record: &mut ErrorRecord) -> Result<Vec<StackFrame>, StructureError> {
    let needle = format!("failure: {}: {}", record.id, record.message);
    let failures: Vec<ElementRef<'_>> = page
        .select(&CBMC)
        .filter(|div| normalized_text(*div).contains(&needle))
        .collect();
    if failures.len() != 1 {
        return Err(StructureError::AmbiguousFailure {
            id: record.id.to_string(),
            count: failures.len(),
        });
    }

    let mut stack = vec![StackFrame {
        function: record.function.clone(),
        line: record.line,
    }];

    let callers = failures[0]
        .ancestors()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "div" && e.value().classes().any(|c| c == "function"));

    for caller in callers {
        let header = caller
            .select(&FUNCTION_CALL)
            .next()
            .and_then(|call| call.select(&HEADER).next())
            .ok_or_else(|| StructureError::Missing {
                document: TRACE_PAGE,
                what: format!("function-call header above failure {}", record.id),
            })?;

        if record.is_builtin && record.file.is_none() {
            record.file = header
                .select(&LINK)
                .find_map(|a| a.value().attr("href"))
                .and_then(|href| CALLER_SOURCE.captures(href))
                .map(|caps| caps[1].to_string());
        }

        let text = normalized_text(header);
        let caps = CALL_HEADER
            .captures(&text)
            .ok_or_else(|| StructureError::Unexpected {
                document: TRACE_PAGE,
                context: "function-call header",
                found: text.clone(),
            })?;
        if &caps[1] == "None" {
            break;
        }
        let line = caps[3].parse().map_err(|_| StructureError::Unexpected {
            document: TRACE_PAGE,
            context: "call line",
            found: text.clone(),
        })?;
        stack.push(StackFrame {
            function: caps[1].to_string(),
            line,
        });
    }
    Ok(stack)
}

/// Record `name -> href` for every linked call after the initializer call.
pub fn collect_symbols(page: &Html, symbols: &mut SymbolIndex) {
    for call in page.select(&FUNCTION_CALL).skip(1) {
        let link = call
            .select(&STEP)
            .next()
            .and_then(|step| step.select(&CBMC_ANY).next())
            .and_then(|cbmc| cbmc.select(&LINK).next());
        let Some(link) = link else { continue };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let name: String = link.text().collect();
        symbols
            .entry(name.trim().to_string())
            .or_insert_with(|| href.to_string());
    }
}
