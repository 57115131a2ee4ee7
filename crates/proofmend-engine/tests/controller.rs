use anyhow::{anyhow, Result};
use proofmend_adapters::{RepairConfig, RunStatus, RunStore};
use proofmend_core::{
    AttemptKind, BuildOutcome, BuildRunner, CancelFlag, ErrorId, FailureCause, OracleRequest,
    PatchAnchor, Proposal, RepairOracle,
};
use proofmend_engine::{
    HarnessJob, NullDerefOracle, OracleChain, RepairController, RepairError, RepairPool,
    TargetOutcome,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const HARNESS_FILE: &str = "pkt_harness.c";
const HARNESS: &str = "\
#include <stdlib.h>

void harness(void)
{
    struct packet *pkt = malloc(sizeof(*pkt));
    size_t len;
    parse(pkt, len);
}
";
const NULL_ID: &str = "harness.pointer_dereference.1";
const NULL_MSG: &str = "dereference failure: pointer NULL in pkt->len";

/// One verifier output directory.
#[derive(Clone, Default)]
struct Fixture {
    /// (id, function, line, message), all in the harness file.
    errors: Vec<(&'static str, &'static str, usize, &'static str)>,
    /// harness function line -> hit
    coverage: Vec<(usize, bool)>,
    /// Function the coverage lines are filed under, `harness` when unset.
    coverage_function: Option<&'static str>,
    traces: BTreeMap<String, Value>,
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl Fixture {
    fn with_null_error(line: usize) -> Self {
        Self {
            errors: vec![(NULL_ID, "harness", line, NULL_MSG)],
            coverage: (5..=line).map(|l| (l, true)).collect(),
            ..Self::default()
        }
    }

    fn clean(last_line: usize) -> Self {
        Self {
            coverage: (5..=last_line).map(|l| (l, true)).collect(),
            ..Self::default()
        }
    }

    fn write(&self, harness_dir: &Path) {
        let root = harness_dir.join("build/report");
        fs::create_dir_all(root.join("html/traces")).unwrap();
        fs::create_dir_all(root.join("json")).unwrap();

        let mut by_function: BTreeMap<&str, BTreeMap<usize, Vec<(&str, &str)>>> = BTreeMap::new();
        for (id, function, line, message) in &self.errors {
            by_function
                .entry(*function)
                .or_default()
                .entry(*line)
                .or_default()
                .push((*id, *message));
        }

        let mut functions = String::new();
        for (function, lines) in &by_function {
            let mut blocks = String::new();
            for (line, entries) in lines {
                let items: String = entries
                    .iter()
                    .map(|(id, message)| {
                        format!(
                            r#"<li>[<a href="./traces/{id}.html">trace</a>] {}</li>"#,
                            escape(message)
                        )
                    })
                    .collect();
                blocks.push_str(&format!("<li>Line {line}<ul>{items}</ul></li>"));
            }
            functions.push_str(&format!(
                r#"<li>Function <a href="./{HARNESS_FILE}.html#3">{function}</a><ul>{blocks}</ul></li>"#
            ));
        }
        let files = if functions.is_empty() {
            String::new()
        } else {
            format!(r#"<li>File <a href="./{HARNESS_FILE}.html">{HARNESS_FILE}</a><ul>{functions}</ul></li>"#)
        };
        fs::write(
            root.join("html/index.html"),
            format!(r#"<html><body><div class="errors"><ul>{files}</ul></div></body></html>"#),
        )
        .unwrap();

        let mut traces = serde_json::Map::new();
        for (id, _, _, message) in &self.errors {
            fs::write(
                root.join(format!("html/traces/{id}.html")),
                format!(
                    r#"<html><body><div class="function">
<div class="function-call"><div class="header">Step 1: Function None, File None, Line 0</div></div>
<div class="function-body"><div class="step"><div class="cbmc">failure: {id}: {}</div></div></div>
</div></body></html>"#,
                    escape(message)
                ),
            )
            .unwrap();
            let steps = self.traces.get(*id).cloned().unwrap_or_else(|| json!([]));
            traces.insert(id.to_string(), steps);
        }
        fs::write(
            root.join("json/viewer-trace.json"),
            json!({"viewer-trace": {"traces": traces}}).to_string(),
        )
        .unwrap();

        let hit = self.coverage.iter().filter(|(_, hit)| *hit).count();
        let total = self.coverage.len();
        let lines: serde_json::Map<String, Value> = self
            .coverage
            .iter()
            .map(|(line, hit)| (line.to_string(), json!(if *hit { "hit" } else { "miss" })))
            .collect();
        fs::write(
            root.join("json/viewer-coverage.json"),
            json!({"viewer-coverage": {
                "overall_coverage": {"hit": hit, "total": total, "percentage": hit as f64 / total.max(1) as f64},
                "coverage": {(HARNESS_FILE): {(self.coverage_function.unwrap_or("harness")): lines}}
            }})
            .to_string(),
        )
        .unwrap();

        let failed: Vec<&str> = self.errors.iter().map(|(id, ..)| *id).collect();
        fs::write(
            root.join("json/viewer-result.json"),
            json!({"viewer-result": {"results": {"false": failed}}}).to_string(),
        )
        .unwrap();
    }
}

struct Build {
    outcome: BuildOutcome,
    report: Option<Fixture>,
    cancel: bool,
}

impl Build {
    fn ok(report: Fixture) -> Self {
        Self {
            outcome: BuildOutcome {
                exit_code: Some(0),
                ..BuildOutcome::default()
            },
            report: Some(report),
            cancel: false,
        }
    }

    fn failed(stderr: &str) -> Self {
        Self {
            outcome: BuildOutcome {
                exit_code: Some(2),
                stderr: stderr.to_string(),
                ..BuildOutcome::default()
            },
            report: None,
            cancel: false,
        }
    }

    fn timed_out() -> Self {
        Self {
            outcome: BuildOutcome {
                exit_code: None,
                timed_out: true,
                ..BuildOutcome::default()
            },
            report: None,
            cancel: false,
        }
    }
}

/// Plays back builds in order and remembers the harness text each saw.
struct ScriptedRunner {
    builds: Mutex<VecDeque<Build>>,
    seen: Mutex<Vec<String>>,
    cancel: CancelFlag,
}

impl ScriptedRunner {
    fn new(builds: Vec<Build>, cancel: CancelFlag) -> Self {
        Self {
            builds: Mutex::new(builds.into()),
            seen: Mutex::new(Vec::new()),
            cancel,
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl BuildRunner for ScriptedRunner {
    fn run(&self, workdir: &Path, _timeout: Duration) -> Result<BuildOutcome> {
        self.seen
            .lock()
            .unwrap()
            .push(fs::read_to_string(workdir.join(HARNESS_FILE))?);
        let build = self
            .builds
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected build"))?;
        if let Some(report) = &build.report {
            report.write(workdir);
        }
        if build.cancel {
            self.cancel.cancel();
        }
        Ok(build.outcome)
    }
}

/// Proposes the same anchors every time and remembers each cause it was given.
struct FixedOracle {
    anchors: Vec<PatchAnchor>,
    causes: Mutex<Vec<FailureCause>>,
}

impl FixedOracle {
    fn new(anchors: Vec<PatchAnchor>) -> Self {
        Self {
            anchors,
            causes: Mutex::new(Vec::new()),
        }
    }

    fn causes(&self) -> Vec<FailureCause> {
        self.causes.lock().unwrap().clone()
    }
}

impl RepairOracle for FixedOracle {
    fn propose(&self, request: &OracleRequest<'_>) -> Result<Option<Proposal>> {
        let mut causes = self.causes.lock().unwrap();
        causes.push(request.cause.clone());
        Ok(Some(Proposal {
            anchors: self.anchors.clone(),
            response: json!({"attempt": causes.len()}),
            tokens: Some(json!({"total": 10 * causes.len()})),
        }))
    }
}

fn assume_after_malloc() -> PatchAnchor {
    PatchAnchor {
        target_function: "harness".into(),
        previous_line_of_code: "struct packet *pkt = malloc(sizeof(*pkt));".into(),
        next_line_of_code: "size_t len;".into(),
        code_to_insert: "__CPROVER_assume(pkt != NULL);".into(),
    }
}

fn setup() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let harness = dir.path().join(HARNESS_FILE);
    fs::write(&harness, HARNESS).unwrap();
    (dir, harness)
}

fn config(max_resolution: u32, max_total: u32) -> RepairConfig {
    RepairConfig {
        max_resolution_attempts: max_resolution,
        max_total_attempts: max_total,
        ..RepairConfig::default()
    }
}

#[test]
fn resolving_edit_is_kept_and_recorded() {
    let (dir, harness) = setup();
    let cancel = CancelFlag::new();
    let runner = ScriptedRunner::new(
        vec![Build::ok(Fixture::with_null_error(7)), Build::ok(Fixture::clean(8))],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let run = RepairController::new(&harness, config(3, 6), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap();

    let id = ErrorId::new(NULL_ID);
    assert_eq!(run.outcomes, vec![(id.clone(), TargetOutcome::Resolved { attempts: 1 })]);
    assert!(run.tracker.resolved().contains(&id));
    assert_eq!(run.ledger.entries(), &[6]);

    let patched = fs::read_to_string(&harness).unwrap();
    assert_eq!(patched.lines().nth(5), Some("    __CPROVER_assume(pkt != NULL);"));
    assert_eq!(runner.seen()[1], patched);

    let record = run.tracker.get(&id).unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.added_preconditions, vec!["__CPROVER_assume(pkt != NULL); @ harness:6"]);
    assert_eq!(record.tokens, json!({"total": 10}));
    assert_eq!(record.history.len(), 1);
    assert_eq!(record.history[0].kind, AttemptKind::Full);

    assert_eq!(run.report.status, RunStatus::Completed);
    assert_eq!(run.report.results.preconditions_added.len(), 1);
    let saved = RunStore::new(dir.path()).load(&run.report.run_id).unwrap();
    assert_eq!(saved.results.processed_errors.success.len(), 1);
}

#[test]
fn surviving_error_is_reverted_and_failed() {
    let (_dir, harness) = setup();
    let cancel = CancelFlag::new();
    let runner = ScriptedRunner::new(
        vec![
            Build::ok(Fixture::with_null_error(7)),
            Build::ok(Fixture::with_null_error(8)),
            Build::ok(Fixture::with_null_error(8)),
        ],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let run = RepairController::new(&harness, config(2, 4), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap();

    let id = ErrorId::new(NULL_ID);
    assert_eq!(
        run.outcomes,
        vec![(id.clone(), TargetOutcome::Abandoned { cause: FailureCause::NotFixed })]
    );
    assert!(run.tracker.failed().contains(&id));
    assert!(run.ledger.is_empty());
    assert_eq!(fs::read_to_string(&harness).unwrap(), HARNESS);
    assert_eq!(oracle.causes(), vec![FailureCause::None, FailureCause::NotFixed]);

    let record = run.tracker.get(&id).unwrap();
    assert_eq!(record.history.len(), 2);
    assert!(record.history.iter().all(|a| a.kind == AttemptKind::Full));
    assert_eq!(record.responses.last().unwrap()["feedback"], "did not fix");
    assert_eq!(run.report.results.processed_errors.failure.len(), 1);
}

#[test]
fn anchor_miss_is_a_half_attempt() {
    let (_dir, harness) = setup();
    let cancel = CancelFlag::new();
    let runner = ScriptedRunner::new(vec![Build::ok(Fixture::with_null_error(7))], cancel.clone());
    let oracle = FixedOracle::new(vec![PatchAnchor {
        target_function: "harness".into(),
        previous_line_of_code: "free(pkt);".into(),
        next_line_of_code: String::new(),
        code_to_insert: "__CPROVER_assume(pkt != NULL);".into(),
    }]);

    let run = RepairController::new(&harness, config(3, 2), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap();

    let expected = FailureCause::InsertionAnchorNotFound {
        function: "harness".into(),
        previous_line: "free(pkt);".into(),
        next_line: String::new(),
    };
    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Abandoned { cause: expected.clone() })]
    );
    // only the initial build ran
    assert_eq!(runner.seen().len(), 1);
    assert_eq!(fs::read_to_string(&harness).unwrap(), HARNESS);
    assert_eq!(oracle.causes(), vec![FailureCause::None, expected]);

    let record = run.tracker.get(&ErrorId::new(NULL_ID)).unwrap();
    assert!(record.history.iter().all(|a| a.kind == AttemptKind::Half));
}

#[test]
fn build_failure_is_retried_with_output() {
    let (_dir, harness) = setup();
    let cancel = CancelFlag::new();
    let runner = ScriptedRunner::new(
        vec![
            Build::ok(Fixture::with_null_error(7)),
            Build::failed("pkt_harness.c:6: error: expected ';'"),
            Build::ok(Fixture::clean(8)),
        ],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let run = RepairController::new(&harness, config(3, 6), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap();

    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Resolved { attempts: 2 })]
    );
    let causes = oracle.causes();
    assert!(matches!(
        &causes[1],
        FailureCause::BuildSyntaxError { output } if output.contains("expected ';'")
    ));
}

#[test]
fn lost_target_line_is_a_coverage_regression() {
    let (_dir, harness) = setup();
    let cancel = CancelFlag::new();
    let mut regressed = Fixture::clean(7);
    regressed.coverage.push((8, false));
    let runner = ScriptedRunner::new(
        vec![Build::ok(Fixture::with_null_error(7)), Build::ok(regressed)],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let run = RepairController::new(&harness, config(3, 1), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap();

    let expected = FailureCause::CoverageRegressed {
        lost_line: Some(8),
        missed_block: vec![8],
    };
    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Abandoned { cause: expected })]
    );
    assert_eq!(fs::read_to_string(&harness).unwrap(), HARNESS);
}

#[test]
fn target_function_missing_after_edit_is_a_regression() {
    let (_dir, harness) = setup();
    let cancel = CancelFlag::new();
    let mut renamed = Fixture::clean(8);
    renamed.coverage_function = Some("harness_entry");
    let runner = ScriptedRunner::new(
        vec![Build::ok(Fixture::with_null_error(7)), Build::ok(renamed)],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let run = RepairController::new(&harness, config(3, 1), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap();

    let expected = FailureCause::CoverageRegressed {
        lost_line: Some(8),
        missed_block: Vec::new(),
    };
    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Abandoned { cause: expected })]
    );
    assert_eq!(fs::read_to_string(&harness).unwrap(), HARNESS);
}

#[test]
fn error_on_inserted_line_is_a_contradiction() {
    let (_dir, harness) = setup();
    let cancel = CancelFlag::new();
    let mut contradiction = Fixture::clean(8);
    contradiction.errors.push((
        "harness.assume.2",
        "harness",
        6,
        "dereference failure: pointer invalid in pkt",
    ));
    let runner = ScriptedRunner::new(
        vec![Build::ok(Fixture::with_null_error(7)), Build::ok(contradiction)],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let run = RepairController::new(&harness, config(3, 1), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap();

    let expected = FailureCause::NewContradictoryError {
        line: 6,
        messages: vec!["dereference failure: pointer invalid in pkt".into()],
    };
    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Abandoned { cause: expected })]
    );
    assert!(!run.tracker.contains(&ErrorId::new("harness.assume.2")));
}

#[test]
fn timeout_abandons_and_ends_the_run() {
    let (dir, harness) = setup();
    let cancel = CancelFlag::new();
    let runner = ScriptedRunner::new(
        vec![Build::ok(Fixture::with_null_error(7)), Build::timed_out()],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let err = RepairController::new(&harness, config(3, 6), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap_err();

    assert!(matches!(err, RepairError::BuildAborted { timed_out: true, .. }));
    assert!(runner.seen()[1].contains("__CPROVER_assume"));
    assert_eq!(fs::read_to_string(&harness).unwrap(), HARNESS);

    let runs = RunStore::new(dir.path()).list().unwrap();
    assert_eq!(runs.len(), 1);
    assert!(matches!(runs[0].status, RunStatus::Aborted { .. }));
    assert_eq!(runs[0].results.unresolved, Vec::<ErrorId>::new());
}

#[test]
fn cancel_during_build_restores_harness() {
    let (dir, harness) = setup();
    let cancel = CancelFlag::new();
    let mut cancelling = Build::ok(Fixture::clean(8));
    cancelling.cancel = true;
    let runner = ScriptedRunner::new(
        vec![Build::ok(Fixture::with_null_error(7)), cancelling],
        cancel.clone(),
    );
    let oracle = FixedOracle::new(vec![assume_after_malloc()]);

    let err = RepairController::new(&harness, config(3, 6), &runner, &oracle)
        .with_cancel(cancel)
        .run()
        .unwrap_err();

    assert!(matches!(err, RepairError::Cancelled));
    assert_eq!(fs::read_to_string(&harness).unwrap(), HARNESS);
    let runs = RunStore::new(dir.path()).list().unwrap();
    assert_eq!(runs[0].status, RunStatus::Cancelled);
}

#[test]
fn initial_build_failure_is_reported() {
    let (_dir, harness) = setup();
    let runner = ScriptedRunner::new(vec![Build::failed("missing rule")], CancelFlag::new());
    let oracle = FixedOracle::new(Vec::new());

    let err = RepairController::new(&harness, config(3, 6), &runner, &oracle)
        .run()
        .unwrap_err();
    assert!(matches!(err, RepairError::InitialBuildFailed { exit_code: Some(2), .. }));
    assert!(oracle.causes().is_empty());
}

#[test]
fn empty_proposal_abandons_without_building() {
    let (_dir, harness) = setup();
    let runner = ScriptedRunner::new(vec![Build::ok(Fixture::with_null_error(7))], CancelFlag::new());
    let oracle = FixedOracle::new(Vec::new());

    let run = RepairController::new(&harness, config(3, 6), &runner, &oracle)
        .run()
        .unwrap();
    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Abandoned { cause: FailureCause::NoCandidates })]
    );
    assert_eq!(runner.seen().len(), 1);
}

#[test]
fn null_deref_oracle_repairs_end_to_end() {
    let (dir, harness) = setup();
    let mut initial = Fixture::with_null_error(7);
    initial.traces.insert(
        NULL_ID.to_string(),
        json!([
            {"kind": "function-call",
             "location": {"function": "harness", "file": HARNESS_FILE, "line": 3},
             "detail": {}},
            {"kind": "variable-assignment",
             "location": {"function": "harness", "file": HARNESS_FILE, "line": 5},
             "detail": {"lhs": "pkt", "lhs-lexical-scope": "harness::pkt", "rhs-value": "NULL"}},
            {"kind": "failure",
             "location": {"function": "harness", "file": HARNESS_FILE, "line": 7},
             "detail": {"property": NULL_ID, "reason": NULL_MSG}}
        ]),
    );
    let runner = ScriptedRunner::new(
        vec![Build::ok(initial), Build::ok(Fixture::clean(8))],
        CancelFlag::new(),
    );
    let oracle = NullDerefOracle::new(dir.path(), "_harness.c");

    let run = RepairController::new(&harness, config(3, 6), &runner, &oracle)
        .run()
        .unwrap();
    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Resolved { attempts: 1 })]
    );
    assert!(fs::read_to_string(&harness)
        .unwrap()
        .contains("    struct packet *pkt = malloc(sizeof(*pkt));\n    __CPROVER_assume(pkt != NULL);\n"));
}

/// Oracle that always fails the request.
struct Unreachable;

impl RepairOracle for Unreachable {
    fn propose(&self, _request: &OracleRequest<'_>) -> Result<Option<Proposal>> {
        Err(anyhow!("oracle offline"))
    }
}

#[test]
fn chain_falls_through_failing_oracle() {
    let (_dir, harness) = setup();
    let runner = ScriptedRunner::new(
        vec![Build::ok(Fixture::with_null_error(7)), Build::ok(Fixture::clean(8))],
        CancelFlag::new(),
    );
    let chain = OracleChain::new()
        .with(Unreachable)
        .with(FixedOracle::new(vec![assume_after_malloc()]));
    assert_eq!(chain.len(), 2);

    let run = RepairController::new(&harness, config(3, 6), &runner, &chain)
        .run()
        .unwrap();
    assert_eq!(
        run.outcomes,
        vec![(ErrorId::new(NULL_ID), TargetOutcome::Resolved { attempts: 1 })]
    );
}

/// Every build fails before verification.
struct BrokenBuild;

impl BuildRunner for BrokenBuild {
    fn run(&self, _workdir: &Path, _timeout: Duration) -> Result<BuildOutcome> {
        Ok(BuildOutcome {
            exit_code: Some(2),
            stderr: "no rule to make target".into(),
            ..BuildOutcome::default()
        })
    }
}

#[test]
fn pool_returns_results_in_job_order() {
    let (first_dir, first) = setup();
    let (second_dir, second) = setup();
    let jobs = vec![
        HarnessJob::with_config(&first, config(3, 6)),
        HarnessJob::with_config(&second, config(3, 6)),
    ];
    let pool = RepairPool::new(2).unwrap();
    assert_eq!(pool.threads(), 2);

    let results = pool.run_all(&jobs, &BrokenBuild, &Unreachable, &CancelFlag::new());
    let paths: Vec<&PathBuf> = results.iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec![&first, &second]);
    for (_, result) in &results {
        assert!(matches!(result, Err(RepairError::InitialBuildFailed { .. })));
    }
    assert_eq!(RunStore::new(first_dir.path()).list().unwrap().len(), 1);
    assert_eq!(RunStore::new(second_dir.path()).list().unwrap().len(), 1);
}
