use async_trait::async_trait;
use std::sync::Arc;

use crate::context::QueryContext;
use crate::error::Result;

/// One link in the request-processing chain. A stage may answer the
/// request directly, mutate the context and delegate to `next`, or both
/// (delegating first and inspecting the response on unwind).
#[async_trait]
pub trait Stage: Send + Sync {
    async fn execute(&self, ctx: &mut QueryContext, next: Next) -> Result<()>;
}

/// Cursor over the remainder of a chain. Cloneable and `'static` so
/// detached tasks (e.g. a cache's background refresh) can re-invoke the
/// tail of the chain on a forked context.
#[derive(Clone)]
pub struct Next {
    stages: Arc<[Arc<dyn Stage>]>,
    pos: usize,
}

impl Next {
    pub async fn run(&self, ctx: &mut QueryContext) -> Result<()> {
        match self.stages.get(self.pos) {
            Some(stage) => {
                let next = Next {
                    stages: Arc::clone(&self.stages),
                    pos: self.pos + 1,
                };
                stage.execute(ctx, next).await
            }
            None => Ok(()),
        }
    }
}

/// An ordered chain of stages.
#[derive(Clone)]
pub struct Chain {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Chain {
            stages: stages.into(),
        }
    }

    /// Drive a context through every stage in order.
    pub async fn run(&self, ctx: &mut QueryContext) -> Result<()> {
        self.entry().run(ctx).await
    }

    /// A cursor positioned at the head of the chain.
    pub fn entry(&self) -> Next {
        Next {
            stages: Arc::clone(&self.stages),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
