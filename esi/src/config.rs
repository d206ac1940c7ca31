use std::time::Duration;

/// This struct is used to configure optional behaviour within the ESI processor.
///
/// ## Usage Example
/// ```rust,no_run
/// use std::time::Duration;
///
/// let config = esi_interpreter::Configuration::default()
///     .with_namespace("app")
///     .with_fetch_timeout(Duration::from_secs(2));
/// ```
#[allow(clippy::return_self_not_must_use)]
#[derive(Clone, Debug)]
pub struct Configuration {
    /// The namespace used to identify ESI instructions, e.g. `esi` for `<esi:include>`.
    pub namespace: String,
    /// For working with non-HTML ESI templates, e.g. JSON files, this option allows you to disable the unescaping of URLs
    pub is_escaped_content: bool,
    /// Whether `<!--esi ... -->` comment wrappers are unwrapped and processed.
    pub process_esi_comments: bool,
    /// Per-request timeout applied by [`crate::HttpFetcher`].
    pub fetch_timeout: Duration,
    /// Whether [`crate::adapter::respond`] returns the unprocessed document when processing fails.
    pub passthrough_on_error: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            namespace: String::from("esi"),
            is_escaped_content: true,
            process_esi_comments: true,
            fetch_timeout: Duration::from_secs(10),
            passthrough_on_error: false,
        }
    }
}

impl Configuration {
    /// Sets an alternative ESI namespace, which is used to identify ESI instructions.
    ///
    /// For example, setting this to `test` would cause the processor to only match tags like `<test:include>`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
    /// For working with non-HTML ESI templates, eg JSON files, allows to disable URLs unescaping
    pub fn with_escaped(mut self, is_escaped: impl Into<bool>) -> Self {
        self.is_escaped_content = is_escaped.into();
        self
    }
    /// Enables or disables processing of `<!--esi ... -->` comment wrappers.
    pub fn with_esi_comments(mut self, enabled: bool) -> Self {
        self.process_esi_comments = enabled;
        self
    }
    /// Sets the timeout for a single fragment request.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
    /// When enabled, a document that cannot be assembled is served as-is instead of failing.
    pub fn with_passthrough_on_error(mut self, enabled: bool) -> Self {
        self.passthrough_on_error = enabled;
        self
    }
}
