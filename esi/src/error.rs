use thiserror::Error;

/// Describes an error encountered during ESI document processing.
#[derive(Error, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum ExecutionError {
    /// The fragment request completed, but with a status code of 400 or above.
    #[error("received unexpected status code for fragment `{0}`: {1}")]
    UnexpectedStatus(String, u16),

    /// The fragment request could not be sent or its body could not be read.
    #[error("error sending fragment request `{url}`: {reason}")]
    RequestError { url: String, reason: String },

    /// The include URL could not be turned into a request.
    #[error("invalid request URL provided: `{0}`")]
    InvalidRequestUrl(String),

    /// An include failed and neither an `alt` nor `onerror="continue"` recovered it.
    #[error("unresolved include `{url}`")]
    UnresolvedInclude {
        url: String,
        #[source]
        source: Box<ExecutionError>,
    },

    /// A library function rejected its arguments.
    #[error("error in function: {0}")]
    FunctionError(String),

    /// A `matches` pattern is not a valid regular expression.
    #[error("invalid regular expression: {0}")]
    RegexError(#[from] regex::Error),

    /// A `$name(...)` call could not be parsed.
    #[error("expression error: {0}")]
    ExpressionParseError(String),

    /// The HTTP client backing [`crate::HttpFetcher`] could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClientError(#[from] reqwest::Error),
}

impl ExecutionError {
    /// The URL of the fragment request that caused this error, if there is one.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::UnexpectedStatus(url, _)
            | Self::RequestError { url, .. }
            | Self::InvalidRequestUrl(url)
            | Self::UnresolvedInclude { url, .. } => Some(url),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
