use thiserror::Error;

/// Errors raised by the doublet density workflow
///
/// ### Variants
///
/// * `InvalidInput` - Malformed dimensions or parameters. Fatal; the caller
///   needs to fix the inputs.
/// * `InsufficientData` - A sample does not hold enough cells for a robust
///   MAD estimate. Reported per sample by the threshold caller and never
///   fatal to the whole batch.
/// * `Linalg` - A decomposition in the projection step failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DoubletError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("sample '{sample}' has {n_cells} cells; at least {min_cells} are needed for MAD thresholding")]
    InsufficientData {
        sample: String,
        n_cells: usize,
        min_cells: usize,
    },
    #[error("linear algebra failure: {0}")]
    Linalg(String),
}

impl DoubletError {
    /// Shorthand to generate an `InvalidInput` error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        DoubletError::InvalidInput(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DoubletError>;
