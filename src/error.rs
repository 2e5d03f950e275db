use std::{error::Error, fmt, io};

use engine::EngineErr;

/// The estimator's result type.
pub type Result<T> = std::result::Result<T, EstimatorErr>;

/// All errors that can occur while driving an estimator.
#[derive(Debug)]
pub enum EstimatorErr {
    /// The execution engine failed.
    Engine(EngineErr),
    /// Invalid configuration, caught before touching the session.
    InvalidConfig(String),
    /// The session was closed abruptly after a fatal failure.
    SessionDead,
    /// The training loss became `NaN`.
    NanLoss { step: u64 },
    /// A hook failed.
    Hook { hook: String, msg: String },
    Io(io::Error),
    Json(serde_json::Error),
}

impl EstimatorErr {
    /// Returns `true` if this error signals the exhaustion of the input data.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_out_of_range())
    }

    /// Returns `true` if the engine aborted the run without corrupting its state.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_recoverable())
    }
}

impl fmt::Display for EstimatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "engine error: {e}"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::SessionDead => write!(
                f,
                "the session was closed after a fatal error, build a new estimator"
            ),
            Self::NanLoss { step } => write!(f, "model diverged with loss = NaN at step {step}"),
            Self::Hook { hook, msg } => write!(f, "hook {hook} failed: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for EstimatorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Engine(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineErr> for EstimatorErr {
    fn from(value: EngineErr) -> Self {
        Self::Engine(value)
    }
}

impl From<io::Error> for EstimatorErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for EstimatorErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
