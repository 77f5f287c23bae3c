//! Ошибки сессии и сигналинга

/// Result с ошибкой сессии
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Код сессии не найден в хранилище (видно пользователю)
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Описание применено не в том порядке или не парсится
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Хранилище сигналинга недоступно
    #[error("Signaling store unavailable: {0}")]
    StoreUnavailable(String),

    /// Транспорт сообщил failed/disconnected
    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Можно ли повторить попытку (host/join заново)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::TransportFailed(_))
    }

    pub(crate) fn transport(e: impl std::fmt::Display) -> Self {
        Error::TransportFailed(e.to_string())
    }

    pub(crate) fn description(e: impl std::fmt::Display) -> Self {
        Error::InvalidDescription(e.to_string())
    }
}
