use thiserror::Error;

/// Outcomes of engine operations that callers are expected to act on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::NotFound("111222333".to_string());
        assert_eq!(format!("{}", err), "Device not found: 111222333");
    }

    #[test]
    fn test_store_error_from_anyhow() {
        let err: EngineError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, EngineError::Store(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
