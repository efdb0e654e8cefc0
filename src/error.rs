use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("expected record with index {expected}, got {actual}")]
    InvalidIndex { expected: i64, actual: i64 },
    #[error("checksum mismatch for record {index}")]
    InvalidChecksum { index: i64 },
    #[error("asqn {asqn} is lower than last appended asqn {last}")]
    InvalidAsqn { last: i64, asqn: i64 },
    #[error("writer already active")]
    WriterAlreadyActive,
    #[error("journal is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn io_errors_keep_their_source() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "io error: disk gone");
    }

    #[test]
    fn rejected_appends_describe_themselves() {
        let err = Error::InvalidIndex {
            expected: 4,
            actual: 7,
        };
        assert_eq!(err.to_string(), "expected record with index 4, got 7");
    }
}
