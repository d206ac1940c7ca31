#![doc = include_str!("../README.md")]

pub mod adapter;
mod condition;
mod config;
mod document;
mod error;
mod expression;
mod fetch;
mod functions;
mod interpolate;
mod parse;
mod variables;

use crate::document::{PendingContent, Scope, Task};
use futures_util::FutureExt;
use log::{debug, error, warn};
use std::borrow::Cow;
use std::sync::Arc;

pub use crate::condition::{evaluate_condition, ConditionResult};
pub use crate::config::Configuration;
pub use crate::error::{ExecutionError, Result};
pub use crate::expression::{evaluate_assignment, EvalContext};
pub use crate::fetch::{Fetcher, HttpFetcher};
pub use crate::functions::{EsiFunction, FunctionRegistry};
pub use crate::interpolate::interpolate;
pub use crate::parse::{parse_attributes, rewrite_esi_comments, scan, Attributes, Fragment, RawTag};
pub use crate::variables::{Value, Variables, MATCHES};

/// An interpreter for ESI documents.
///
/// The Processor holds the configuration, the [`Fetcher`] used for
/// `<esi:include>` requests and the functions available to expressions.
/// Cloning it is cheap, and every pending include owns a clone.
///
/// # Example
/// ```rust,no_run
/// use esi_interpreter::{Configuration, HttpFetcher, Processor};
///
/// # async fn run() -> esi_interpreter::Result<()> {
/// let config = Configuration::default();
/// let fetcher = HttpFetcher::new(&config)?.with_base_url("https://origin.example")?;
/// let processor = Processor::new(fetcher, config);
///
/// let html = processor
///     .process_document("<esi:include src=\"/header\"/><p>body</p>")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Processor {
    // The configuration for the processor.
    configuration: Configuration,
    // Performs the fragment requests.
    fetcher: Arc<dyn Fetcher>,
    // Functions callable as `$name(...)`.
    functions: Arc<FunctionRegistry>,
}

// The attributes of one `<esi:include>`, with `src` and `alt` already substituted.
struct Include {
    src: String,
    alt: Option<String>,
    reprocess: bool,
    continue_on_error: bool,
}

impl Processor {
    pub fn new(fetcher: impl Fetcher + 'static, configuration: Configuration) -> Self {
        Self {
            configuration,
            fetcher: Arc::new(fetcher),
            functions: Arc::new(FunctionRegistry::default()),
        }
    }

    /// Replaces the function library, e.g. with [`FunctionRegistry::default`] plus custom functions.
    #[allow(clippy::return_self_not_must_use)]
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Arc::new(functions);
        self
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Processes a document with an empty variable context.
    pub async fn process_document(&self, document: &str) -> Result<String> {
        let mut variables = Variables::new();
        self.interpret(document, &mut variables, true).await
    }

    /// Processes a document with a pre-populated variable context,
    /// such as `HTTP_HOST` or `QUERY_STRING` of the client request.
    pub async fn process_document_with(
        &self,
        document: &str,
        mut variables: Variables,
    ) -> Result<String> {
        self.interpret(document, &mut variables, true).await
    }

    /// Interprets `body` and resolves every include in it.
    ///
    /// Directives that only read or write variables are applied to
    /// `variables` in document order before any request is awaited; the
    /// includes then run concurrently and their output is joined in document
    /// order. When `inside_tag` is false, top-level text is copied without
    /// variable substitution.
    ///
    /// Any include that fails without being recovered by `alt`,
    /// `onerror="continue"` or an enclosing `<esi:try>` fails the whole call.
    pub async fn interpret(
        &self,
        body: &str,
        variables: &mut Variables,
        inside_tag: bool,
    ) -> Result<String> {
        let task = self.build_task(body, variables, inside_tag);
        debug!("Elements to fetch: {:?}", task.queue);
        task.resolve().await
    }

    fn build_task(&self, body: &str, variables: &mut Variables, inside_tag: bool) -> Task {
        let mut task = Task::new();
        self.append_document(&mut task, body, variables, inside_tag);
        task.seal_scope(variables);
        task
    }

    fn append_document(
        &self,
        task: &mut Task,
        body: &str,
        variables: &mut Variables,
        inside_tag: bool,
    ) {
        let namespace = &self.configuration.namespace;
        let body = if self.configuration.process_esi_comments {
            rewrite_esi_comments(body, namespace)
        } else {
            Cow::Borrowed(body)
        };

        for fragment in scan(&body, namespace) {
            match fragment {
                Fragment::Text(text) if inside_tag => {
                    let ctx = EvalContext::new(variables, &self.functions);
                    task.push_raw(&interpolate(text, &ctx));
                }
                Fragment::Text(text) => task.push_raw(text),
                Fragment::Tag(tag) => self.tag_receiver(&tag, task, variables),
            }
        }
    }

    // Applies a single tag, pushing its output (or pending output) to the task.
    fn tag_receiver(&self, tag: &RawTag, task: &mut Task, variables: &mut Variables) {
        let attributes = tag.attributes();
        let body = tag.body.unwrap_or("");

        match tag.name.to_ascii_lowercase().as_str() {
            "include" => {
                if let Some(pending) = self.include(&attributes, task.scope(), variables) {
                    task.push_pending(pending);
                }
            }
            "try" => {
                let pending = self.try_block(body, task, variables);
                task.push_pending(pending);
            }
            "vars" => match attributes.get("name") {
                Some(name) if body.is_empty() => {
                    debug!("Handling <esi:vars> tag with name: {:?}", name);
                    let ctx = EvalContext::new(variables, &self.functions);
                    task.push_raw(&interpolate(name, &ctx));
                }
                _ => self.append_document(task, body, variables, true),
            },
            "choose" => {
                let outer = variables.remove_local(MATCHES);
                self.append_document(task, body, variables, true);
                variables.restore_local(MATCHES, outer);
            }
            "when" => {
                if variables.contains_local(MATCHES) {
                    return;
                }
                let Some(test) = attributes.get("test") else {
                    warn!("<esi:when> without a test attribute");
                    return;
                };
                let ctx = EvalContext::new(variables, &self.functions);
                let result = evaluate_condition(test, &ctx);
                debug!("esi:when {} => {:?}", test, result);
                if result.is_truthy() {
                    let value = result.into_value();
                    if let Some(match_name) = attributes.get("matchname") {
                        variables.insert(match_name, value.clone());
                    }
                    variables.insert(MATCHES, value);
                    self.append_document(task, body, variables, true);
                }
            }
            "otherwise" => {
                if !variables.contains_local(MATCHES) {
                    self.append_document(task, body, variables, true);
                }
            }
            "assign" => self.assign(&attributes, body, variables),
            "text" => task.push_raw(body),
            "comment" | "remove" => {}
            name => {
                warn!(
                    "unsupported tag <{}:{}>, passing it through",
                    self.configuration.namespace, name
                );
                task.push_raw(tag.raw);
            }
        }
    }

    fn assign(&self, attributes: &Attributes, body: &str, variables: &mut Variables) {
        let Some(name) = attributes.get("name") else {
            warn!("<esi:assign> without a name attribute");
            return;
        };
        let ctx = EvalContext::new(variables, &self.functions);
        let raw = attributes.get("value").unwrap_or_else(|| body.trim());
        let value = evaluate_assignment(raw, &ctx);
        debug!("esi:assign {} = {:?}", name, value);
        variables.insert(name, value);
    }

    fn include(
        &self,
        attributes: &Attributes,
        scope: Scope,
        variables: &Variables,
    ) -> Option<PendingContent> {
        let Some(src) = attributes.get("src").filter(|src| !src.is_empty()) else {
            error!("<esi:include> without a src attribute");
            return None;
        };

        let ctx = EvalContext::new(variables, &self.functions);
        let include = Include {
            src: interpolate(src, &ctx),
            alt: attributes.get("alt").map(|alt| interpolate(alt, &ctx)),
            reprocess: attributes.get("dca") == Some("esi"),
            continue_on_error: attributes.get("onerror") == Some("continue"),
        };
        debug!("Handling <esi:include> tag with src: {}", include.src);

        Some(self.clone().fetch_include(include, scope).boxed())
    }

    // A reprocessed fragment runs in a child of its level's sealed scope.
    async fn fetch_include(self, include: Include, scope: Scope) -> Result<String> {
        let result = match self.fetch_fragment(&include.src).await {
            Err(err) => match &include.alt {
                Some(alt) => {
                    debug!("request for {} failed ({}), trying alt {}", include.src, err, alt);
                    self.fetch_fragment(alt).await
                }
                None => Err(err),
            },
            ok => ok,
        };

        match result {
            Ok(body) if include.reprocess => {
                let mut child = scope.get().map(Variables::child).unwrap_or_default();
                self.interpret(&body, &mut child, true).await
            }
            Ok(body) => Ok(body),
            Err(err) if include.continue_on_error => {
                warn!("include {} failed, continuing: {}", include.src, err);
                Ok(String::new())
            }
            Err(err) => {
                error!("include {} failed: {}", include.src, err);
                Err(ExecutionError::UnresolvedInclude {
                    url: include.src,
                    source: Box::new(err),
                })
            }
        }
    }

    // For HTML content the URL is unescaped if it's escaped (default).
    // It can be disabled in the processor configuration for a non-HTML content.
    async fn fetch_fragment(&self, url: &str) -> Result<String> {
        let url = if self.configuration.is_escaped_content {
            match quick_xml::escape::unescape(url) {
                Ok(url) => url.into_owned(),
                // A bare `&` in a query string is not an entity. Decode what can be decoded.
                Err(err) => {
                    debug!("lenient unescaping of {}: {}", url, err);
                    html_escape::decode_html_entities(url).into_owned()
                }
            }
        } else {
            url.to_string()
        };
        self.fetcher.fetch(&url).await
    }

    // The attempt is planned immediately as part of the current level, so its
    // includes start with the rest of the document. The except body is only
    // interpreted if the attempt fails.
    fn try_block(&self, body: &str, task: &Task, variables: &mut Variables) -> PendingContent {
        let mut attempt = None;
        let mut except = None;
        for fragment in scan(body, &self.configuration.namespace) {
            if let Fragment::Tag(tag) = fragment {
                match tag.name.to_ascii_lowercase().as_str() {
                    "attempt" => attempt = Some(tag.body.unwrap_or("")),
                    "except" => except = Some(tag.body.unwrap_or("").to_string()),
                    _ => {}
                }
            }
        }

        let mut attempt_task = Task::sharing_scope(task.scope());
        self.append_document(&mut attempt_task, attempt.unwrap_or(""), variables, true);
        let processor = self.clone();
        let scope = task.scope();

        async move {
            match attempt_task.resolve().await {
                Ok(output) => Ok(output),
                Err(err) => match except {
                    Some(except) => {
                        warn!("esi:attempt failed, processing esi:except: {}", err);
                        let mut except_scope =
                            scope.get().map(Variables::child).unwrap_or_default();
                        processor.interpret(&except, &mut except_scope, true).await
                    }
                    None => Err(err),
                },
            }
        }
        .boxed()
    }
}
