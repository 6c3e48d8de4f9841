use thiserror::Error;

/// Error taxonomy for the temporal history engine.
///
/// Store-level failures are wrapped, never swallowed: the adapter error stays
/// attached as the source and the variant records which operation was running.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("store error during {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an adapter failure with the operation that triggered it.
    pub fn store(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// A store-class error that did not originate in a library error type,
    /// e.g. a malformed row shape coming back from the adapter.
    pub fn store_msg(context: impl Into<String>, message: impl Into<String>) -> Self {
        #[derive(Debug, Error)]
        #[error("{0}")]
        struct Message(String);

        Error::Store {
            context: context.into(),
            source: Box::new(Message(message.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound("checkpoint cp-1".to_string());
        assert_eq!(err.to_string(), "not found: checkpoint cp-1");
    }

    #[test]
    fn test_store_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        let err = Error::store("open_edge", io);
        assert!(err.to_string().contains("open_edge"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_store_msg_context() {
        let err = Error::store_msg("get_checkpoint", "missing column `id`");
        assert!(matches!(err, Error::Store { .. }));
        assert!(err.to_string().contains("missing column `id`"));
    }

    #[test]
    fn test_serialization_conversion() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
