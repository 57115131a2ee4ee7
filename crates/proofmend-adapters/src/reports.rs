//! Verifier output directory layout and document loading.
//!
//! ```text
//! <report_dir>/html/index.html
//! <report_dir>/html/traces/<id>.html
//! <report_dir>/json/viewer-trace.json
//! <report_dir>/json/viewer-coverage.json
//! <report_dir>/json/viewer-result.json
//! ```

use anyhow::{Context, Result};
use proofmend_core::coverage::CoverageDocument;
use proofmend_core::trace::TraceDocument;
use proofmend_core::{ErrorId, StructureError};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ReportLayout {
    root: PathBuf,
}

impl ReportLayout {
    pub fn new(harness_dir: &Path, report_dir: &Path) -> Self {
        Self {
            root: harness_dir.join(report_dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn html_dir(&self) -> PathBuf {
        self.root.join("html")
    }

    pub fn index(&self) -> PathBuf {
        self.html_dir().join("index.html")
    }

    pub fn json(&self, name: &str) -> PathBuf {
        self.root.join("json").join(format!("{}.json", name))
    }

    /// Resolve a trace-page href from the index (`./traces/<id>.html`).
    pub fn trace_page(&self, href: &str) -> PathBuf {
        self.html_dir().join(href.trim_start_matches("./"))
    }

    pub fn read_index(&self) -> Result<String> {
        read(&self.index())
    }

    pub fn read_trace_page(&self, href: &str) -> Result<String> {
        read(&self.trace_page(href))
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Ids listed under `viewer-result.results.false`.
pub fn parse_failed_results(json: &str) -> Result<BTreeSet<ErrorId>, StructureError> {
    let value: Value = serde_json::from_str(json).map_err(|source| StructureError::Json {
        document: "viewer-result",
        source,
    })?;
    let failed = value
        .pointer("/viewer-result/results/false")
        .and_then(Value::as_array)
        .ok_or_else(|| StructureError::Missing {
            document: "viewer-result",
            what: "viewer-result.results.false".to_string(),
        })?;
    failed
        .iter()
        .map(|id| {
            id.as_str()
                .map(ErrorId::new)
                .ok_or_else(|| StructureError::Unexpected {
                    document: "viewer-result",
                    context: "result id",
                    found: id.to_string(),
                })
        })
        .collect()
}

/// Loading a bundle either failed to read a file or read one that does not
/// have the expected shape.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error(transparent)]
    Io(#[from] anyhow::Error),
    #[error(transparent)]
    Structure(#[from] StructureError),
}

/// Everything the verifier wrote for one build, except per-error trace pages
/// which are read on demand.
#[derive(Debug, Clone)]
pub struct ReportBundle {
    pub layout: ReportLayout,
    pub index_html: String,
    pub traces: TraceDocument,
    pub coverage: CoverageDocument,
    pub failed_results: BTreeSet<ErrorId>,
}

impl ReportBundle {
    pub fn load(layout: &ReportLayout) -> Result<Self, BundleError> {
        let index_html = layout.read_index()?;
        let traces = TraceDocument::parse(&read(&layout.json("viewer-trace"))?)?;
        let coverage = CoverageDocument::parse(&read(&layout.json("viewer-coverage"))?)?;
        let failed_results = parse_failed_results(&read(&layout.json("viewer-result"))?)?;
        Ok(Self {
            layout: layout.clone(),
            index_html,
            traces,
            coverage,
            failed_results,
        })
    }

    pub fn read_trace_page(&self, href: &str) -> Result<String> {
        self.layout.read_trace_page(href)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_ids() {
        let ids = parse_failed_results(
            r#"{"viewer-result": {"results": {"false": ["a.1", "b.2"], "true": ["c.3"]}}}"#,
        )
        .unwrap();
        assert_eq!(ids, BTreeSet::from([ErrorId::new("a.1"), ErrorId::new("b.2")]));
        assert!(parse_failed_results(r#"{"viewer-result": {}}"#).is_err());
    }

    #[test]
    fn loads_bundle_from_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ReportLayout::new(dir.path(), Path::new("build/report"));
        fs::create_dir_all(layout.html_dir().join("traces")).unwrap();
        fs::create_dir_all(layout.root().join("json")).unwrap();
        fs::write(layout.index(), r#"<div class="errors"></div>"#).unwrap();
        fs::write(layout.trace_page("./traces/x.html"), "<html></html>").unwrap();
        fs::write(
            layout.json("viewer-trace"),
            r#"{"viewer-trace": {"traces": {"x": []}}}"#,
        )
        .unwrap();
        fs::write(
            layout.json("viewer-coverage"),
            r#"{"viewer-coverage": {"overall_coverage": {"hit": 1, "total": 2, "percentage": 0.5}, "coverage": {}}}"#,
        )
        .unwrap();
        fs::write(
            layout.json("viewer-result"),
            r#"{"viewer-result": {"results": {"false": ["x"]}}}"#,
        )
        .unwrap();

        let bundle = ReportBundle::load(&layout).unwrap();
        assert_eq!(bundle.traces.len(), 1);
        assert_eq!(bundle.coverage.hit_count(), 1);
        assert!(bundle.failed_results.contains(&ErrorId::new("x")));
        assert_eq!(bundle.read_trace_page("./traces/x.html").unwrap(), "<html></html>");
    }

    #[test]
    fn missing_document_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ReportLayout::new(dir.path(), Path::new("build/report"));
        let err = ReportBundle::load(&layout).unwrap_err();
        assert!(matches!(err, BundleError::Io(_)));
        assert!(err.to_string().contains("index.html"));
    }

    #[test]
    fn malformed_document_is_a_structure_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ReportLayout::new(dir.path(), Path::new("report"));
        fs::create_dir_all(layout.html_dir()).unwrap();
        fs::create_dir_all(layout.root().join("json")).unwrap();
        fs::write(layout.index(), "<html></html>").unwrap();
        fs::write(layout.json("viewer-trace"), r#"{"viewer-trace": {}}"#).unwrap();
        let err = ReportBundle::load(&layout).unwrap_err();
        assert!(matches!(err, BundleError::Structure(_)));
    }
}
