use thiserror::Error;

/// Ошибки хранилища и работы с токенами.
///
/// `Storage` и `Corrupt` означают отказ нижнего слоя; `Validation` и
/// `MalformedSecret` означают отклонённый ввод, и срабатывают всегда
/// до какой-либо записи.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("stored data is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),

    #[error("invalid OTP secret: {0}")]
    MalformedSecret(String),
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn malformed_secret(msg: impl Into<String>) -> Self {
        StoreError::MalformedSecret(msg.into())
    }
}
