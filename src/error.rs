use thiserror::Error;

use crate::store::ValueId;

#[derive(Error, Debug)]
pub enum EmaError {
    /// An observation cannot be broadcast onto the value it updates.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// `average` was asked about a quantity that was never applied.
    #[error("No moving average is tracked for `{0}`")]
    UnknownQuantity(String),

    #[error("No variable with id {0:?} exists in this store")]
    UnknownVariable(ValueId),

    #[error("Variable name `{0}` is already in use")]
    DuplicateName(String),

    #[error("Invalid decay {0} (must be in (0,1))")]
    InvalidDecay(f32),

    #[error("Checkpoint has no entry named `{0}`")]
    MissingCheckpointEntry(String),

    #[error("Checkpoint encoding error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Checkpoint decoding error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub type Result<T> = std::result::Result<T, EmaError>;
