use crate::snapshot::HarnessSnapshot;
use proofmend_core::patch::{insert_all, Insertion};
use proofmend_core::{InsertError, LineLedger, PatchAnchor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Insert(#[from] InsertError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Apply every anchor to the snapshotted harness. The file and `ledger` are
/// only touched when all anchors were found.
pub fn patch_harness(
    snapshot: &HarnessSnapshot,
    anchors: &[PatchAnchor],
    ledger: &mut LineLedger,
) -> Result<Vec<Insertion>, PatchError> {
    let source = snapshot.current_text()?;
    let mut trial = ledger.clone();
    let (text, applied) = insert_all(&source, anchors, &mut trial)?;
    // the ledger only advances once the file on disk matches it
    snapshot.write(&text)?;
    *ledger = trial;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SOURCE: &str = "void harness(void)\n{\n    char *buf = malloc(n);\n    use(buf);\n}\n";

    fn anchor(prev: &str) -> PatchAnchor {
        PatchAnchor {
            target_function: "harness".into(),
            previous_line_of_code: prev.into(),
            next_line_of_code: String::new(),
            code_to_insert: "__CPROVER_assume(buf != NULL);".into(),
        }
    }

    #[test]
    fn anchor_miss_leaves_file_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf_harness.c");
        fs::write(&path, SOURCE).unwrap();
        let snapshot = HarnessSnapshot::capture(&path).unwrap();
        let mut ledger = LineLedger::new();

        let err = patch_harness(&snapshot, &[anchor("free(buf);")], &mut ledger).unwrap_err();
        assert!(matches!(err, PatchError::Insert(_)));
        assert_eq!(fs::read(&path).unwrap(), SOURCE.as_bytes());
        assert!(ledger.is_empty());
        snapshot.commit();
    }

    #[test]
    fn applied_edit_is_written_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf_harness.c");
        fs::write(&path, SOURCE).unwrap();
        let snapshot = HarnessSnapshot::capture(&path).unwrap();
        let mut ledger = LineLedger::new();

        let applied = patch_harness(&snapshot, &[anchor("char *buf = malloc(n);")], &mut ledger).unwrap();
        assert_eq!(applied[0].line, 4);
        assert_eq!(ledger.entries(), &[4]);
        assert!(fs::read_to_string(&path)
            .unwrap()
            .contains("    __CPROVER_assume(buf != NULL);\n    use(buf);"));

        drop(snapshot);
        assert_eq!(fs::read(&path).unwrap(), SOURCE.as_bytes());
    }
}
