use thiserror::Error;

pub type ZerdeResult<T> = Result<T, ZerdeError>;

/// Wire-level failures. All of them mean builder and parser disagree, so none
/// are recoverable on the channel that produced them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZerdeError {
    #[error("read of {wanted} slot(s) at slot {at} runs past the {slots}-slot message")]
    Truncated { at: usize, wanted: usize, slots: usize },

    #[error("message header claims {bytes} bytes but {available} are available")]
    InvalidHeader { bytes: u64, available: usize },

    #[error("unknown param type tag {0}")]
    UnknownParamType(u32),

    #[error("string contains an unpaired UTF-16 surrogate")]
    InvalidString,

    #[error("message needs {requested} slots, more than the format can address")]
    TooLarge { requested: usize },

    #[error("backing storage refused to grow to {slots} slots: {reason}")]
    Grow { slots: usize, reason: String },
}
