//! Acting-user / timestamp propagation.
//!
//! Every mutating operation needs to know who is acting and what "now" is.
//! The public surface takes an [`OpContext`] explicitly — no globals. For
//! request handlers that would otherwise thread the context through many
//! layers, [`scope`] binds a task-local copy that [`OpContext::current`]
//! reads back; the binding is restored on every exit path and is inherited
//! by futures awaited inside the scope.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::future::Future;

#[derive(Debug, Clone, PartialEq)]
pub struct OpContext {
    pub actor: String,
    pub now: DateTime<Utc>,
}

impl OpContext {
    pub fn new(actor: impl Into<String>, now: DateTime<Utc>) -> Self {
        OpContext {
            actor: actor.into(),
            now,
        }
    }

    /// Context stamped with the current wall clock.
    pub fn acting(actor: impl Into<String>) -> Self {
        OpContext::new(actor, Utc::now())
    }

    /// The context bound by the innermost [`scope`], if any.
    pub fn current() -> Result<OpContext> {
        CURRENT
            .try_with(|ctx| ctx.clone())
            .map_err(|_| Error::ContextMissing)
    }
}

tokio::task_local! {
    static CURRENT: OpContext;
}

/// Runs `fut` with `ctx` bound as the task-local operation context.
pub async fn scope<F>(ctx: OpContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}
