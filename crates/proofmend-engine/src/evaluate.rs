//! Turn a rebuilt report directory into parsed, trace-enriched errors.

use crate::error::EvaluateError;
use proofmend_adapters::{RepairConfig, ReportBundle, ReportLayout};
use proofmend_core::coverage::CoverageDocument;
use proofmend_core::trace::{SymbolIndex, TraceAnalyzer, TraceDocument};
use proofmend_core::{ErrorId, LineLedger, ParsedReport, ReportParser};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

/// One rebuild, fully parsed.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub parsed: ParsedReport,
    pub traces: TraceDocument,
    pub coverage: CoverageDocument,
    /// Ids the verifier lists under `results.false`.
    pub failed_results: BTreeSet<ErrorId>,
    pub symbols: SymbolIndex,
}

impl Evaluation {
    /// An id is present if the report lists it or the verifier still marks
    /// its property as failing.
    pub fn contains(&self, id: &ErrorId) -> bool {
        self.failed_results.contains(id) || self.parsed.get(id).is_some()
    }
}

pub struct Evaluator {
    layout: ReportLayout,
    parser: ReportParser,
    analyzer: TraceAnalyzer,
}

impl Evaluator {
    pub fn new(config: &RepairConfig, harness_dir: &Path) -> Self {
        Self {
            layout: ReportLayout::new(harness_dir, &config.report_dir),
            parser: ReportParser::new(config.parse_options()),
            analyzer: TraceAnalyzer::new(config.harness_suffix.clone()),
        }
    }

    pub fn layout(&self) -> &ReportLayout {
        &self.layout
    }

    /// Parse the current report directory against `ledger`.
    pub fn evaluate(&self, ledger: &LineLedger) -> Result<Evaluation, EvaluateError> {
        let bundle = ReportBundle::load(&self.layout)?;
        let mut parsed = self.parser.parse(&bundle.index_html, ledger)?;

        let mut symbols = SymbolIndex::new();
        for record in parsed.records_mut() {
            let page = bundle.read_trace_page(&record.trace_page)?;
            self.analyzer
                .analyze(record, &bundle.traces, &page, &mut symbols)?;
        }
        debug!(
            errors = parsed.len(),
            failed_results = bundle.failed_results.len(),
            coverage = bundle.coverage.overall_percentage(),
            "report evaluated"
        );

        Ok(Evaluation {
            parsed,
            traces: bundle.traces,
            coverage: bundle.coverage,
            failed_results: bundle.failed_results,
            symbols,
        })
    }
}
