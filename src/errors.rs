//! Error types for the CFG → PEG lift.
//!
//! Every variant is fatal for the procedure being lifted; nothing here is
//! retried and no partial PEG is exposed. DOT output failures are *not*
//! represented here: they are reported on stderr and the lift proceeds.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiftError {
    /// A block terminator that is neither a two-way conditional branch nor a
    /// single-successor jump (e.g. a switch).
    #[error("unsupported terminator in block `{block}`")]
    UnsupportedTerminator { block: String },

    /// The decide recursion was handed an edge set with no common dominator.
    /// An empty input edge set is the usual culprit.
    #[error("no common dominator for input edge set")]
    MissingDominator,

    /// A block was never registered in the condition map.
    #[error("no condition node registered for block `{block}`")]
    MissingCondition { block: String },

    /// The decide recursion descended past the header of a loop it had not
    /// entered. Selecting the loop-escape value would need Eval/Pass nodes,
    /// which this lift does not synthesize; such procedures are rejected.
    #[error("cannot select across the boundary of loop headed by `{header}`")]
    LoopEscape { header: String },

    /// Malformed textual CFG description.
    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, LiftError>;
