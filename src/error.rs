use thiserror::Error;

#[derive(Error, Debug)]
pub enum VarianceError {
    #[error("Mixed currency in account {account_id}: expected {expected}, found {found}")]
    MixedCurrency {
        account_id: String,
        expected: String,
        found: String,
    },

    #[error("Malformed row at line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },

    #[error("Model endpoint unreachable at {endpoint}: {details}")]
    ModelUnreachable { endpoint: String, details: String },

    #[error("Could not parse model response: {0}")]
    ResponseParseFailure(String),

    #[error("Model response failed validation: {0}")]
    ResponseValidationFailure(String),

    #[error("Retries exhausted after {attempts} attempts, last failure: {last_failure}")]
    RetryExhausted { attempts: u32, last_failure: String },

    #[error("Invalid configuration value for {field}: {details}")]
    InvalidConfig { field: String, details: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl VarianceError {
    /// Errors that reject a single account or row rather than degrading to an OPEN commentary.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            VarianceError::MixedCurrency { .. } | VarianceError::MalformedRow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, VarianceError>;
