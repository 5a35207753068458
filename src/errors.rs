use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("effective value not found")]
    EffectiveValueNotFound,
}

pub type TreeResult<T> = Result<T, TreeError>;

/// Raised (as a panic) when a thread releases a lock it does not own.
///
/// This is a caller bug, not a runtime condition: it is never handed out as an
/// `Err`, only used as the panic message of [`crate::ReentrantLock::release`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unlock from non-owner thread")]
pub struct LockOwnershipViolation;
