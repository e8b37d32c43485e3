use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Output envelope of any step or run: a partial fragment, the final result,
/// or a failure. Exactly one of `is_fragment`, `is_done`, `is_error` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "value", rename_all = "snake_case")]
pub enum FlowData<T> {
    Fragment(T),
    Done(T),
    Error(StrandError),
}

impl<T> FlowData<T> {
    pub fn fragment(item: T) -> Self {
        Self::Fragment(item)
    }

    pub fn done(result: T) -> Self {
        Self::Done(result)
    }

    pub fn error(cause: StrandError) -> Self {
        Self::Error(cause)
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self, Self::Fragment(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Done and Error end a stream; fragments do not.
    pub fn is_terminal(&self) -> bool {
        !self.is_fragment()
    }

    /// The fragment item.
    ///
    /// # Panics
    /// Panics if this is not a fragment.
    pub fn as_fragment(&self) -> &T {
        match self {
            Self::Fragment(item) => item,
            other => panic!("FlowData is not a fragment: {}", other.kind()),
        }
    }

    /// The final result.
    ///
    /// # Panics
    /// Panics if this is not `Done`.
    pub fn as_done(&self) -> &T {
        match self {
            Self::Done(result) => result,
            other => panic!("FlowData is not done: {}", other.kind()),
        }
    }

    /// The failure cause.
    ///
    /// # Panics
    /// Panics if this is not an error.
    pub fn as_error(&self) -> &StrandError {
        match self {
            Self::Error(cause) => cause,
            other => panic!("FlowData is not an error: {}", other.kind()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fragment(_) => "fragment",
            Self::Done(_) => "done",
            Self::Error(_) => "error",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FlowData<U> {
        match self {
            Self::Fragment(item) => FlowData::Fragment(f(item)),
            Self::Done(result) => FlowData::Done(f(result)),
            Self::Error(cause) => FlowData::Error(cause),
        }
    }

    /// Convert a terminal signal into a `Result`. Fragments are rejected.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Done(result) => Ok(result),
            Self::Error(cause) => Err(cause),
            Self::Fragment(_) => Err(StrandError::config(
                "expected a terminal signal, got a fragment",
            )),
        }
    }
}

impl<T> From<Result<T>> for FlowData<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Done(value),
            Err(e) => Self::Error(e),
        }
    }
}
