//! Verifier HTML report parsing
//!
//! The report lists violations as nested lists:
//!
//! ```text
//! div.errors
//!   li "File pkt_harness.c"          (or "File <builtin-library-memcpy>")
//!     li "Function harness"          <a href="./pkt_harness.c.html#...">
//!       ul > li "Line 42"
//!         ul > li "[<a href="./traces/ID.html">trace</a>] message"
//!   li "Other failures"
//!     li "foo.no-body.bar"
//! ```
//!
//! Every message becomes an [`ErrorRecord`] keyed by its trace id and grouped
//! by [`ErrorCluster`]. Anything that does not fit this shape is a
//! [`StructureError`].

use crate::cluster::ErrorCluster;
use crate::error::{ContradictionError, ReportError, StructureError};
use crate::ledger::LineLedger;
use crate::record::{ErrorId, ErrorRecord};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::debug;


const DOCUMENT: &str = "html report";

static ERRORS_DIV: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.errors").unwrap());
static LI: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li").unwrap());
static UL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("ul").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

static FILE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^File (<builtin-library-.*>|.*\.(c|h))").unwrap());
static NO_BODY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.*)\.no-body\.(.*)$").unwrap());
static FUNCTION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Function ([a-zA-Z0-9_]+)").unwrap());
static SOURCE_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\.+/)?(.*\.(c|h))\.html").unwrap());
static LINE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Line (\d+)").unwrap());
static TRACE_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\./traces/(.+)\.html$").unwrap());

/// What to do with a line that reports several dereference failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefDedupPolicy {
    /// When one of them is "pointer NULL", keep only that one.
    #[default]
    CollapseToNull,
    KeepAll,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub harness_suffix: String,
    pub deref_dedup: DerefDedupPolicy,
    pub drop_pointer_relation: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            harness_suffix: "_harness.c".to_string(),
            deref_dedup: DerefDedupPolicy::CollapseToNull,
            drop_pointer_relation: true,
        }
    }
}

/// Errors grouped by cluster, plus functions the verifier found no body for.
#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    pub clusters: BTreeMap<ErrorCluster, BTreeMap<ErrorId, ErrorRecord>>,
    pub undefined_functions: Vec<String>,
}

impl ParsedReport {
    pub fn is_empty(&self) -> bool {
        self.clusters.values().all(|errors| errors.is_empty())
    }

    pub fn len(&self) -> usize {
        self.clusters.values().map(|errors| errors.len()).sum()
    }

    pub fn ids(&self) -> BTreeSet<ErrorId> {
        self.records().map(|r| r.id.clone()).collect()
    }

    pub fn get(&self, id: &ErrorId) -> Option<&ErrorRecord> {
        self.clusters.values().find_map(|errors| errors.get(id))
    }

    pub fn records(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.clusters.values().flat_map(|errors| errors.values())
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut ErrorRecord> {
        self.clusters.values_mut().flat_map(|errors| errors.values_mut())
    }

    fn insert(&mut self, record: ErrorRecord) {
        self.clusters
            .entry(record.cluster)
            .or_default()
            .insert(record.id.clone(), record);
    }
}

pub fn is_harness_file(path: &str, harness_suffix: &str) -> bool {
    path.ends_with(harness_suffix)
}

pub struct ReportParser {
    options: ParseOptions,
}

/// One `[trace]` line inside a line block.
struct TraceEntry {
    id: ErrorId,
    href: String,
    message: String,
}

impl ReportParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Parse the report against the current ledger. Fails with
    /// [`ReportError::Contradiction`] when a violation sits on one of our
    /// inserted harness lines.
    pub fn parse(&self, html: &str, ledger: &LineLedger) -> Result<ParsedReport, ReportError> {
        let document = Html::parse_document(html);
        let errors = document
            .select(&ERRORS_DIV)
            .next()
            .ok_or_else(|| StructureError::Missing {
                document: DOCUMENT,
                what: "div.errors".to_string(),
            })?;

        let mut report = ParsedReport::default();
        for li in errors.select(&LI) {
            let text = heading_text(li);
            if text.starts_with("Other failures") {
                report
                    .undefined_functions
                    .extend(self.undefined_functions(li)?);
            } else if let Some(caps) = FILE_HEADING.captures(&text) {
                let is_builtin = caps[1].starts_with("<builtin-library-");
                self.parse_file(li, is_builtin, ledger, &mut report)?;
            }
        }

        debug!(
            errors = report.len(),
            undefined = report.undefined_functions.len(),
            "parsed verifier report"
        );
        Ok(report)
    }

    fn undefined_functions(&self, li: ElementRef<'_>) -> Result<Vec<String>, StructureError> {
        let mut names = Vec::new();
        for entry in li.select(&LI) {
            let text = normalized_text(entry);
            if text.contains("recursion") {
                continue;
            }
            let caps = NO_BODY.captures(&text).ok_or_else(|| StructureError::Unexpected {
                document: DOCUMENT,
                context: "other failures entry",
                found: text.clone(),
            })?;
            names.push(caps[2].to_string());
        }
        Ok(names)
    }

    fn parse_file(
        &self,
        file_li: ElementRef<'_>,
        is_builtin: bool,
        ledger: &LineLedger,
        report: &mut ParsedReport,
    ) -> Result<(), ReportError> {
        let Some(first) = file_li.select(&LI).next() else {
            return Ok(());
        };
        let functions = std::iter::once(first).chain(
            first
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .filter(|e| e.value().name() == "li"),
        );

        for function_li in functions {
            let text = heading_text(function_li);
            let function = FUNCTION_HEADING
                .captures(&text)
                .map(|caps| caps[1].to_string())
                .ok_or_else(|| StructureError::Unexpected {
                    document: DOCUMENT,
                    context: "function entry",
                    found: text.clone(),
                })?;

            let file = if is_builtin {
                None
            } else {
                Some(source_path(function_li)?)
            };

            let blocks = function_li.select(&UL).next().ok_or_else(|| {
                StructureError::Missing {
                    document: DOCUMENT,
                    what: format!("line list for function {}", function),
                }
            })?;
            for block in child_items(blocks) {
                self.parse_line_block(block, &function, file.as_deref(), ledger, report)?;
            }
        }
        Ok(())
    }

    fn parse_line_block(
        &self,
        block: ElementRef<'_>,
        function: &str,
        file: Option<&str>,
        ledger: &LineLedger,
        report: &mut ParsedReport,
    ) -> Result<(), ReportError> {
        let text = heading_text(block);
        let line: usize = LINE_HEADING
            .captures(&text)
            .and_then(|caps| caps[1].parse().ok())
            .ok_or_else(|| StructureError::Unexpected {
                document: DOCUMENT,
                context: "line block",
                found: text.clone(),
            })?;

        let entries_ul = block.select(&UL).next().ok_or_else(|| StructureError::Missing {
            document: DOCUMENT,
            what: format!("trace list for {} line {}", function, line),
        })?;
        let entries = child_items(entries_ul)
            .map(trace_entry)
            .collect::<Result<Vec<_>, _>>()?;

        let in_harness = file.is_some_and(|f| is_harness_file(f, &self.options.harness_suffix));
        if in_harness && ledger.is_inserted(line) {
            return Err(ContradictionError {
                line,
                messages: entries.into_iter().map(|e| e.message).collect(),
            }
            .into());
        }
        let raw_line = if in_harness {
            ledger.to_raw(line)
        } else {
            Some(line)
        };

        let distinct: BTreeSet<&str> = entries.iter().map(|e| e.message.as_str()).collect();
        let collapse_derefs = self.options.deref_dedup == DerefDedupPolicy::CollapseToNull
            && distinct.len() > 1
            && distinct
                .iter()
                .any(|m| m.starts_with("dereference failure: pointer NULL"));

        for entry in entries {
            if self.options.drop_pointer_relation && entry.message.contains("pointer relation") {
                continue;
            }
            if collapse_derefs
                && entry.message.contains("dereference failure")
                && !entry.message.contains("pointer NULL")
            {
                continue;
            }
            let mut record = ErrorRecord::new(
                entry.id,
                function,
                file.map(str::to_string),
                line,
                entry.message,
            );
            record.raw_line = raw_line;
            record.trace_page = entry.href;
            report.insert(record);
        }
        Ok(())
    }
}

fn trace_entry(li: ElementRef<'_>) -> Result<TraceEntry, StructureError> {
    let text = normalized_text(li);
    let href = li
        .select(&LINK)
        .find_map(|a| a.value().attr("href"))
        .ok_or_else(|| StructureError::Unexpected {
            document: DOCUMENT,
            context: "trace entry without link",
            found: text.clone(),
        })?;
    let id = TRACE_HREF
        .captures(href)
        .map(|caps| ErrorId::new(&caps[1]))
        .ok_or_else(|| StructureError::Unexpected {
            document: DOCUMENT,
            context: "trace link",
            found: href.to_string(),
        })?;
    let message = text
        .split_once("[trace]")
        .map(|(_, rest)| rest.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| StructureError::Unexpected {
            document: DOCUMENT,
            context: "trace entry",
            found: text.clone(),
        })?;
    Ok(TraceEntry {
        id,
        href: href.to_string(),
        message,
    })
}

fn source_path(function_li: ElementRef<'_>) -> Result<String, StructureError> {
    let href = function_li
        .select(&LINK)
        .find_map(|a| a.value().attr("href"))
        .unwrap_or_default();
    SOURCE_HREF
        .captures(href)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| StructureError::Unexpected {
            document: DOCUMENT,
            context: "source file link",
            found: href.to_string(),
        })
}

/// Direct `li` children of a list element.
fn child_items<'a>(list: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    list.children()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "li")
}

/// Text of a list item without its nested lists, whitespace collapsed.
fn heading_text(item: ElementRef<'_>) -> String {
    let mut text = String::new();
    for child in item.children() {
        if let Some(element) = ElementRef::wrap(child) {
            if element.value().name() != "ul" {
                text.extend(element.text());
            }
        } else if let Some(fragment) = child.value().as_text() {
            text.push_str(fragment);
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Element text with runs of whitespace collapsed.
pub(crate) fn normalized_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
