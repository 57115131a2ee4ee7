//! Debugging questions handed to the oracle for each error cluster.

use proofmend_core::ErrorCluster;

/// Questions for `cluster`. `harness` names the harness file the oracle is
/// editing.
pub fn advice_for(cluster: ErrorCluster, harness: &str) -> Vec<String> {
    match cluster {
        ErrorCluster::MemcpySrc => vec![
            "Do the variable values provided show that the source pointer is NULL or invalid?".into(),
            "Do the variable values provided show that the source region is allocated sufficient space for the copy?".into(),
            format!(
                "If the allocated size is not sufficient and the copy size seems correct, are there any checks in {} that would prevent the failing line from being called?",
                harness
            ),
            "If the allocated size is sufficient, do the variable values provided indicate that pointer arithmetic can cause the readable region of the source pointer to be invalid or smaller than the copy size?".into(),
        ],
        ErrorCluster::MemcpyDest => vec![
            "Do the variable values provided show that the destination pointer is NULL or invalid?".into(),
            "Do the variable values provided show that the destination region is allocated sufficient space for the copy?".into(),
            "If the allocated size is not sufficient, do the variable values provided indicate the copy size larger than seems necessary?".into(),
            format!(
                "If the allocated size is not sufficient and the copy size seems correct, are there any checks in {} that would prevent the failing line from being called?",
                harness
            ),
            "If the allocated size is sufficient, do the variable values and function definitions provided indicate that pointer arithmetic can cause the writeable region of the destination pointer to be invalid or smaller than the copy size?".into(),
        ],
        ErrorCluster::MemcpyOverlap => vec![
            "Based on the harness definition provided, are the source and destination pointers both directly allocated?".into(),
        ],
        ErrorCluster::ArithmeticOverflow => vec![
            "Based on the variable values provided, which variable in the equation is responsible for causing the overflow?".into(),
            "If the responsible variable is initially defined in the harness, what constraints must be added to prevent the overflow?".into(),
            "If the responsible variable was not defined in a harness or stub, was it returned from an undefined function or set as a global variable?".into(),
        ],
        ErrorCluster::DerefNull => vec![
            "Based on the variable values provided, does the NULL pointer have a precondition that prevents it from being NULL?".into(),
            "If there is such a precondition, is the pointer variable ever assigned the return value of an undefined function?".into(),
            "If the pointer variable is not set to the return value of an undefined function, are there any other assignments to that variable that could result in a NULL value?".into(),
        ],
        ErrorCluster::DerefArrayOob => vec![
            "Based on the variable values provided, is the offset read from the pointer greater than the allocated size of the pointer?".into(),
            "If the offset is larger than the allocated size of the pointer, does the allocated size have a reasonable lower bound?".into(),
            "If the offset is larger than the allocated size of the pointer and there is a reasonable lower bound on the allocated size, does the offset have a reasonable upper bound?".into(),
            "If the offset value should be within the allocated pointer size based on the variable values provided, is there any arithmetic performed that would cause the offset to become larger than the allocated pointer size?".into(),
        ],
        // Only useful once the oracle sees every type definition the harness uses.
        ErrorCluster::DerefObjectOob => vec![
            "Based on the variable values provided, is the object allocated sufficient space for the field it attempts to read?".into(),
        ],
        ErrorCluster::Misc => Vec::new(),
    }
}
