//! Coverage oracle over `viewer-coverage.json`.

use crate::error::StructureError;
use crate::ledger::LineLedger;
use crate::report::is_harness_file;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const DOCUMENT: &str = "viewer-coverage";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub hit: u64,
    pub total: u64,
    #[serde(default)]
    pub percentage: f64,
}

/// Per-function line counts, computed from the line map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCoverage {
    pub file: String,
    pub function: String,
    pub hit: usize,
    pub total: usize,
}

impl FunctionCoverage {
    pub fn missed(&self) -> usize {
        self.total.saturating_sub(self.hit)
    }

    pub fn is_partial(&self) -> bool {
        self.hit > 0 && self.hit < self.total
    }
}

/// Start of a missed block chosen for coverage work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncoveredTarget {
    pub file: String,
    pub function: String,
    pub start_line: usize,
}

type LineMap = BTreeMap<usize, bool>;

#[derive(Debug, Clone, Default)]
pub struct CoverageDocument {
    overall: CoverageSummary,
    /// file -> function -> line -> covered
    lines: BTreeMap<String, BTreeMap<String, LineMap>>,
}

#[derive(Deserialize)]
struct RawCoverage {
    overall_coverage: CoverageSummary,
    #[serde(default)]
    coverage: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
}

fn is_miss(status: &str) -> bool {
    matches!(status, "miss" | "missed")
}

impl CoverageDocument {
    pub fn parse(json: &str) -> Result<Self, StructureError> {
        let value: Value = serde_json::from_str(json).map_err(|source| StructureError::Json {
            document: DOCUMENT,
            source,
        })?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: Value) -> Result<Self, StructureError> {
        let body = value
            .get_mut("viewer-coverage")
            .map(Value::take)
            .ok_or_else(|| StructureError::Missing {
                document: DOCUMENT,
                what: "viewer-coverage".to_string(),
            })?;
        let raw: RawCoverage = serde_json::from_value(body).map_err(|source| {
            StructureError::Json {
                document: DOCUMENT,
                source,
            }
        })?;

        let mut lines = BTreeMap::new();
        for (file, functions) in raw.coverage {
            let mut by_function = BTreeMap::new();
            for (function, statuses) in functions {
                let mut map = LineMap::new();
                for (line, status) in statuses {
                    let line = line.parse().map_err(|_| StructureError::Unexpected {
                        document: DOCUMENT,
                        context: "line key",
                        found: line.clone(),
                    })?;
                    map.insert(line, !is_miss(&status));
                }
                by_function.insert(function, map);
            }
            lines.insert(file, by_function);
        }

        Ok(Self {
            overall: raw.overall_coverage,
            lines,
        })
    }

    pub fn overall(&self) -> CoverageSummary {
        self.overall
    }

    pub fn hit_count(&self) -> u64 {
        self.overall.hit
    }

    /// Covered fraction in `[0, 1]`.
    pub fn overall_percentage(&self) -> f64 {
        if self.overall.total == 0 {
            return 0.0;
        }
        (self.overall.hit as f64 / self.overall.total as f64).clamp(0.0, 1.0)
    }

    fn function_lines(&self, file: &str, function: &str) -> Result<&LineMap, StructureError> {
        self.lines
            .get(file)
            .ok_or_else(|| StructureError::Missing {
                document: DOCUMENT,
                what: format!("file {}", file),
            })?
            .get(function)
            .ok_or_else(|| StructureError::Missing {
                document: DOCUMENT,
                what: format!("function {} in {}", function, file),
            })
    }

    /// Whether `raw_line` still executes. Lines in the harness file are mapped
    /// through the ledger. A line the verifier does not list is not covered.
    pub fn is_line_covered(
        &self,
        file: &str,
        function: &str,
        raw_line: usize,
        ledger: &LineLedger,
        harness_suffix: &str,
    ) -> Result<bool, StructureError> {
        let line = if is_harness_file(file, harness_suffix) {
            ledger.to_current(raw_line)
        } else {
            raw_line
        };
        let lines = self.function_lines(file, function)?;
        Ok(lines.get(&line).copied().unwrap_or(false))
    }

    /// The contiguous missed run containing `line`, in current numbering.
    pub fn missed_block_around(&self, file: &str, function: &str, line: usize) -> Vec<usize> {
        let Ok(lines) = self.function_lines(file, function) else {
            return Vec::new();
        };
        let mut block = Vec::new();
        for (&current, &covered) in lines {
            if covered {
                if block.contains(&line) {
                    return block;
                }
                block.clear();
            } else {
                block.push(current);
            }
        }
        if block.contains(&line) {
            block
        } else {
            Vec::new()
        }
    }

    /// Start line of the largest missed run in `function` whose start is not
    /// in `skip`. Ties go to the earlier block.
    pub fn largest_uncovered_block(
        &self,
        function: &str,
        skip: &BTreeSet<usize>,
    ) -> Option<usize> {
        self.lines
            .values()
            .filter_map(|functions| functions.get(function))
            .flat_map(missed_blocks)
            .filter(|(start, _)| !skip.contains(start))
            .fold(None, |best: Option<(usize, usize)>, (start, len)| match best {
                Some((_, best_len)) if best_len >= len => best,
                _ => Some((start, len)),
            })
            .map(|(start, _)| start)
    }

    pub fn function_summaries(&self) -> Vec<FunctionCoverage> {
        self.lines
            .iter()
            .flat_map(|(file, functions)| {
                functions.iter().map(move |(function, lines)| FunctionCoverage {
                    file: file.clone(),
                    function: function.clone(),
                    hit: lines.values().filter(|covered| **covered).count(),
                    total: lines.len(),
                })
            })
            .collect()
    }

    /// Next partially covered function to work on: any harness function
    /// first, then `target` in `target_file`, then the rest by most missed
    /// lines. Functions whose blocks are all in `skip` are passed over.
    pub fn next_uncovered_function(
        &self,
        target_file: &str,
        target: &str,
        skip: &BTreeMap<String, BTreeSet<usize>>,
    ) -> Option<UncoveredTarget> {
        let mut harness = None;
        let mut target_entry = None;
        let mut rest = Vec::new();
        for summary in self.function_summaries() {
            if !summary.is_partial() {
                continue;
            }
            if harness.is_none() && summary.function.to_lowercase().contains("harness") {
                harness = Some(summary);
            } else if target_entry.is_none()
                && summary.function == target
                && target_file.ends_with(&summary.file)
            {
                target_entry = Some(summary);
            } else {
                rest.push(summary);
            }
        }
        rest.sort_by(|a, b| b.missed().cmp(&a.missed()));

        let empty = BTreeSet::new();
        harness
            .into_iter()
            .chain(target_entry)
            .chain(rest)
            .find_map(|entry| {
                let skipped = skip.get(&entry.function).unwrap_or(&empty);
                let lines = self.lines.get(&entry.file)?.get(&entry.function)?;
                missed_blocks(lines)
                    .into_iter()
                    .filter(|(start, _)| !skipped.contains(start))
                    .fold(None, |best: Option<(usize, usize)>, (start, len)| match best {
                        Some((_, best_len)) if best_len >= len => best,
                        _ => Some((start, len)),
                    })
                    .map(|(start_line, _)| UncoveredTarget {
                        file: entry.file.clone(),
                        function: entry.function.clone(),
                        start_line,
                    })
            })
    }
}

/// `(start, length)` of every run of consecutive missed entries.
fn missed_blocks(lines: &LineMap) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (&line, &covered) in lines {
        if covered {
            blocks.extend(current.take());
        } else {
            match current.as_mut() {
                Some((_, len)) => *len += 1,
                None => current = Some((line, 1)),
            }
        }
    }
    blocks.extend(current);
    blocks
}
