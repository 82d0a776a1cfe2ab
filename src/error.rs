use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum SymbolError {
    #[display("invalid symbol format: {input}")]
    FormatInvalid { input: String },
}

#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("failed to connect to {exchange}")]
    Connection { exchange: String },
    #[display("request to {exchange} failed")]
    Request { exchange: String },
    #[display("failed to parse response from {exchange}")]
    ResponseParse { exchange: String },
    #[display("rate limit exceeded for {exchange}")]
    RateLimited {
        exchange: String,
        retry_after_secs: Option<u64>,
    },
    #[display("{exchange} does not list market {symbol}")]
    #[allow(dead_code)]
    SymbolUnsupported { exchange: String, symbol: String },
    #[display("{exchange} rejected authentication")]
    #[allow(dead_code)]
    AuthFailed { exchange: String },
}

#[derive(Debug, Display, Error)]
pub enum PersistError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to write record")]
    Write,
}

#[derive(Debug, Display, Error)]
pub enum NotifyError {
    #[display("channel {channel} delivery failed")]
    Delivery { channel: String },
    #[display("channel {channel} rejected payload with status {status}")]
    Rejected { channel: String, status: u16 },
    #[display("channel {channel} delivery timed out")]
    Timeout { channel: String },
}

impl NotifyError {
    /// Delivery and timeout failures are transient; a 4xx rejection is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery { .. } | Self::Timeout { .. })
    }

    /// Short kind tag stored in notification records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delivery { .. } => "delivery",
            Self::Rejected { .. } => "rejected",
            Self::Timeout { .. } => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_not_retryable() {
        let err = NotifyError::Rejected {
            channel: "webhook".into(),
            status: 400,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "rejected");
    }

    #[test]
    fn delivery_and_timeout_are_retryable() {
        let delivery = NotifyError::Delivery {
            channel: "telegram".into(),
        };
        let timeout = NotifyError::Timeout {
            channel: "webhook".into(),
        };
        assert!(delivery.is_retryable());
        assert!(timeout.is_retryable());
    }
}
