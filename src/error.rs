use thiserror::Error;

/// Errors returned by the lifecycle core.
///
/// Every failure is reported to the immediate caller as one of these kinds.
///
/// 生命周期核心返回的错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed or out-of-range input, e.g. a domain id outside 0..=230.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Unknown handle or domain id, or an object whose deletion has begun.
    #[error("not found")]
    NotFound,

    /// Configuration and request disagree.
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    /// Allocation or subsystem creation failed.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Another thread already won the deletion race for this handle.
    #[error("deletion already in progress")]
    AlreadyDeleting,

    /// The operation is not meaningful for this kind of object.
    #[error("unsupported operation")]
    Unsupported,

    /// An external collaborator (configuration, protocol engine, ...) failed.
    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

pub type Result<T> = std::result::Result<T, Error>;
