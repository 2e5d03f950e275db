use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire engine.
pub type Result<T> = std::result::Result<T, EngineErr>;

/// The engine's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineErr {
    /// A data iterator has no more elements to yield.
    OutOfRange { iterator: String },
    /// The run was aborted, no state corruption is implied.
    Aborted(String),
    /// The engine is temporarily unavailable.
    Unavailable(String),
    InvalidArgument(String),
    FailedPrecondition(String),
    /// Tried to add a node to a frozen graph.
    GraphFrozen { node: String },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    SessionClosed,
    Internal(String),
}

impl EngineErr {
    /// Returns `true` if this error signals the exhaustion of a data source.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, EngineErr::OutOfRange { .. })
    }

    /// Returns `true` if this error means the session was asked to stop but its
    /// state is still consistent.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineErr::Aborted(_) | EngineErr::Unavailable(_))
    }
}

impl Display for EngineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErr::OutOfRange { iterator } => {
                write!(f, "end of sequence reached for iterator {iterator}")
            }
            EngineErr::Aborted(msg) => write!(f, "aborted: {msg}"),
            EngineErr::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            EngineErr::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineErr::FailedPrecondition(msg) => write!(f, "failed precondition: {msg}"),
            EngineErr::GraphFrozen { node } => {
                write!(f, "cannot add {node} to the graph, the graph is frozen")
            }
            EngineErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch in {what}, got {got:?} and expected {expected:?}"
            ),
            EngineErr::SessionClosed => write!(f, "attempted to use a closed session"),
            EngineErr::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl Error for EngineErr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_aborted_and_unavailable_are_recoverable() {
        assert!(EngineErr::Aborted("stop".into()).is_recoverable());
        assert!(EngineErr::Unavailable("gone".into()).is_recoverable());
        assert!(!EngineErr::Internal("boom".into()).is_recoverable());
        assert!(
            !EngineErr::OutOfRange {
                iterator: "it".into()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn out_of_range_is_exhaustion() {
        let err = EngineErr::OutOfRange {
            iterator: "train/iterator".into(),
        };
        assert!(err.is_out_of_range());
        assert_eq!(
            err.to_string(),
            "end of sequence reached for iterator train/iterator"
        );
    }
}
