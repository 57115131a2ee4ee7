//! Error clusters
//!
//! Every verifier message is sorted into exactly one cluster. The enum order
//! is the repair priority: `DerefNull` is always attempted first.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCluster {
    DerefNull,
    MemcpySrc,
    MemcpyDest,
    MemcpyOverlap,
    ArithmeticOverflow,
    DerefArrayOob,
    DerefObjectOob,
    Misc,
}

static PATTERNS: LazyLock<Vec<(ErrorCluster, Regex)>> = LazyLock::new(|| {
    [
        (ErrorCluster::MemcpySrc, r"^memcpy source region readable"),
        (ErrorCluster::MemcpyDest, r"^memcpy destination region writeable"),
        (ErrorCluster::MemcpyOverlap, r"^memcpy src/dst overlap"),
        (ErrorCluster::ArithmeticOverflow, r"^arithmetic overflow"),
        (ErrorCluster::DerefNull, r"^dereference failure: pointer NULL"),
        (
            ErrorCluster::DerefArrayOob,
            r"^dereference failure: pointer outside object bounds in .*\[",
        ),
        (
            ErrorCluster::DerefObjectOob,
            r"^dereference failure: pointer outside object bounds in .*->",
        ),
    ]
    .into_iter()
    .map(|(cluster, pattern)| (cluster, Regex::new(pattern).unwrap()))
    .collect()
});

impl ErrorCluster {
    pub const ALL: [ErrorCluster; 8] = [
        ErrorCluster::DerefNull,
        ErrorCluster::MemcpySrc,
        ErrorCluster::MemcpyDest,
        ErrorCluster::MemcpyOverlap,
        ErrorCluster::ArithmeticOverflow,
        ErrorCluster::DerefArrayOob,
        ErrorCluster::DerefObjectOob,
        ErrorCluster::Misc,
    ];

    /// Classify a verifier message. First matching pattern wins.
    pub fn classify(message: &str) -> Self {
        PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(message))
            .map(|(cluster, _)| *cluster)
            .unwrap_or(ErrorCluster::Misc)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorCluster::DerefNull => "deref_null",
            ErrorCluster::MemcpySrc => "memcpy_src",
            ErrorCluster::MemcpyDest => "memcpy_dest",
            ErrorCluster::MemcpyOverlap => "memcpy_overlap",
            ErrorCluster::ArithmeticOverflow => "arithmetic_overflow",
            ErrorCluster::DerefArrayOob => "deref_arr_oob",
            ErrorCluster::DerefObjectOob => "deref_obj_oob",
            ErrorCluster::Misc => "misc",
        }
    }
}

impl fmt::Display for ErrorCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_prefixes() {
        assert_eq!(
            ErrorCluster::classify("dereference failure: pointer NULL in *buf"),
            ErrorCluster::DerefNull
        );
        assert_eq!(
            ErrorCluster::classify("memcpy source region readable"),
            ErrorCluster::MemcpySrc
        );
        assert_eq!(
            ErrorCluster::classify("memcpy src/dst overlap"),
            ErrorCluster::MemcpyOverlap
        );
        assert_eq!(
            ErrorCluster::classify("arithmetic overflow on signed + in a + b"),
            ErrorCluster::ArithmeticOverflow
        );
        assert_eq!(
            ErrorCluster::classify(
                "dereference failure: pointer outside object bounds in pkt->data[(signed long int)i]"
            ),
            ErrorCluster::DerefArrayOob
        );
        assert_eq!(
            ErrorCluster::classify("dereference failure: pointer outside object bounds in pkt->len"),
            ErrorCluster::DerefObjectOob
        );
    }

    #[test]
    fn unmatched_message_is_misc() {
        assert_eq!(
            ErrorCluster::classify("division by zero in x / y"),
            ErrorCluster::Misc
        );
        // anchored at the start of the message
        assert_eq!(
            ErrorCluster::classify("unwinding assertion; arithmetic overflow"),
            ErrorCluster::Misc
        );
    }

    #[test]
    fn priority_order_starts_with_null_deref() {
        let mut sorted = ErrorCluster::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted.first(), Some(&ErrorCluster::DerefNull));
        assert_eq!(sorted.last(), Some(&ErrorCluster::Misc));
    }
}
