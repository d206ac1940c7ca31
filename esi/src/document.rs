use futures_util::future::{self, BoxFuture, Either};
use log::debug;
use std::sync::{Arc, OnceLock};

use crate::{Result, Variables};

/// The variables of one planning level, set once the whole level is planned.
///
/// Includes hold it instead of a copy of the variables, so a reprocessed
/// fragment sees assignments made after the include at the same level.
pub type Scope = Arc<OnceLock<Variables>>;

/// Content that needs a fetch, or interpretation of a fetched body, before it is known.
pub type PendingContent = BoxFuture<'static, Result<String>>;

/// A section of the output, either text that is already final or pending content.
/// * `Raw` - Final text.
/// * `Pending` - An include or try block still to be resolved.
pub enum Element {
    Raw(String),
    Pending(PendingContent),
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(text) => write!(f, "Raw({} bytes)", text.len()),
            Self::Pending(_) => write!(f, "Pending"),
        }
    }
}

/// The planned output of one interpretation pass, in document order.
///
/// Planning is synchronous: directives that only touch the variables are
/// evaluated while the task is built, so sibling `when` blocks see each
/// other's effects in order. Only includes are left pending, and all of them
/// run concurrently in [`Task::resolve`].
#[derive(Debug, Default)]
pub struct Task {
    pub queue: Vec<Element>,
    scope: Scope,
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    /// A task planned as part of another level, such as an `esi:attempt` body.
    pub fn sharing_scope(scope: Scope) -> Self {
        Self {
            queue: Vec::new(),
            scope,
        }
    }

    pub fn scope(&self) -> Scope {
        Arc::clone(&self.scope)
    }

    /// Records the variables as they are at the end of planning.
    pub fn seal_scope(&self, variables: &Variables) {
        if self.scope.set(variables.clone()).is_err() {
            debug!("scope already sealed");
        }
    }

    pub fn push_raw(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Element::Raw(last)) = self.queue.last_mut() {
            last.push_str(text);
        } else {
            self.queue.push(Element::Raw(text.to_string()));
        }
    }

    pub fn push_pending(&mut self, content: PendingContent) {
        self.queue.push(Element::Pending(content));
    }

    /// Waits for every pending element and joins the results positionally.
    ///
    /// The first failure fails the whole task.
    pub async fn resolve(self) -> Result<String> {
        let parts = future::try_join_all(self.queue.into_iter().map(|element| match element {
            Element::Raw(text) => Either::Left(future::ready(Ok(text))),
            Element::Pending(content) => Either::Right(content),
        }))
        .await?;
        Ok(parts.concat())
    }
}
