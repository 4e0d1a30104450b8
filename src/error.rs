use std::fmt::Display;
use std::sync::Arc;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store, its actions and the effect interpreter
///
/// The error is `Clone` so it can travel through shared futures and be handed
/// to every subscriber of the `error` channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Free-form failure raised by an action, a routine or a future
    #[error("{0}")]
    Failed(Arc<str>),

    /// The task or future was cancelled before it settled
    #[error("task was cancelled")]
    Cancelled,

    /// A routine yielded an effect the interpreter cannot drive
    #[error("invalid suspension request: {0}")]
    InvalidSuspension(&'static str),

    /// No state, computed value or action with this name exists
    #[error("unknown property `{0}`")]
    UnknownProperty(Arc<str>),

    /// The computed value is private and only usable as a dependency
    #[error("property `{0}` is private")]
    PrivateProperty(Arc<str>),

    /// The name belongs to a computed property, which has no state cell
    #[error("`{0}` is a computed property, not a state cell")]
    ComputedProperty(Arc<str>),

    /// The value has not settled yet
    #[error("`{0}` is still pending")]
    Pending(Arc<str>),

    /// A computed value (transitively) depends on itself
    #[error("computed `{0}` depends on itself")]
    CyclicDependency(Arc<str>),

    /// A dependency path expression could not be parsed
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath {
        path: Arc<str>,
        reason: &'static str,
    },

    /// A dependency failed while a computed value was being derived
    #[error("dependency `{name}` failed: {source}")]
    Dependency {
        name: Arc<str>,
        source: Box<StoreError>,
    },

    /// A value could not be converted to or from its typed form
    #[error("serialization error: {0}")]
    Serde(Arc<str>),
}

impl StoreError {
    /// Build a free-form failure from any displayable message
    pub fn msg(message: impl Display) -> Self {
        StoreError::Failed(message.to_string().into())
    }

    pub(crate) fn dependency(name: &str, source: StoreError) -> Self {
        StoreError::Dependency {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// True if this error is the result of a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serde(error.to_string().into())
    }
}
