use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Source unavailable: {message}")]
    SourceUnavailable { message: String },

    #[error("Transcode error: {message}")]
    Transcode { message: String },

    /// Lease timeout. Signals "retry later", not a broken camera.
    #[error("Camera busy: {message}")]
    Busy { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
}

impl StreamError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable { message: message.into() }
    }

    pub fn transcode(message: impl Into<String>) -> Self {
        Self::Transcode { message: message.into() }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn is_source_unavailable(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
