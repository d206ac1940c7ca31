use async_trait::async_trait;
use log::debug;
use reqwest::Url;

use crate::{Configuration, ExecutionError, Result};

/// Performs the fragment requests of `<esi:include>` tags.
///
/// Implementations return the body of a successful response. Any status of
/// 400 or above, or a transport failure, is an error naming the URL.
///
/// ## Usage Example
/// ```rust,no_run
/// use async_trait::async_trait;
///
/// struct Static;
///
/// #[async_trait]
/// impl esi_interpreter::Fetcher for Static {
///     async fn fetch(&self, url: &str) -> esi_interpreter::Result<String> {
///         Ok(format!("content of {url}"))
///     }
/// }
/// ```
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// A [`Fetcher`] sending plain `GET` requests with `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<Url>,
}

impl HttpFetcher {
    /// Builds a client applying the configured fetch timeout to every request.
    pub fn new(configuration: &Configuration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(configuration.fetch_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: None,
        })
    }

    /// Resolves relative include URLs such as `/fragments/header` against `base_url`.
    #[allow(clippy::return_self_not_must_use)]
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|_| ExecutionError::InvalidRequestUrl(base_url.to_string()))?;
        self.base_url = Some(base_url);
        Ok(self)
    }

    fn resolve_url(&self, url: &str) -> Result<Url> {
        let resolved = match &self.base_url {
            Some(base) => base.join(url),
            None => Url::parse(url),
        };
        resolved.map_err(|_| ExecutionError::InvalidRequestUrl(url.to_string()))
    }
}

// Any status of 400 or above is a failed fragment request.
fn check_status(url: &str, status: u16) -> Result<()> {
    if status >= 400 {
        return Err(ExecutionError::UnexpectedStatus(url.to_string(), status));
    }
    Ok(())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let request_url = self.resolve_url(url)?;
        debug!("Requesting ESI fragment: {}", request_url);

        let response = self
            .client
            .get(request_url)
            .send()
            .await
            .map_err(|err| ExecutionError::RequestError {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        check_status(url, response.status().as_u16())?;

        response
            .text()
            .await
            .map_err(|err| ExecutionError::RequestError {
                url: url.to_string(),
                reason: err.to_string(),
            })
    }
}
