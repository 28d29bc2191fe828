#![allow(dead_code)]

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bifrost::chain::{Next, Stage};
use bifrost::context::QueryContext;
use bifrost::error::{ResolveError, Result};
use bifrost::message::{Message, Record};

enum Outcome {
    Answer(Ipv4Addr, u32),
    Empty,
    Fail,
}

/// Terminal stage that counts invocations and resolves with a fixed
/// outcome after an optional delay.
pub struct Probe {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    outcome: Outcome,
}

impl Probe {
    pub fn answering(addr: Ipv4Addr) -> Self {
        Probe {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            outcome: Outcome::Answer(addr, 300),
        }
    }

    pub fn empty() -> Self {
        Probe {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            outcome: Outcome::Empty,
        }
    }

    pub fn failing() -> Self {
        Probe {
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            outcome: Outcome::Fail,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        if let Outcome::Answer(_, ref mut t) = self.outcome {
            *t = ttl;
        }
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Stage for Probe {
    async fn execute(&self, ctx: &mut QueryContext, _next: Next) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.outcome {
            Outcome::Fail => Err(ResolveError::Protocol("probe failure".to_string())),
            Outcome::Empty => {
                ctx.set_response(Message::reply_to(ctx.query()));
                Ok(())
            }
            Outcome::Answer(addr, ttl) => {
                let name = match ctx.query().question() {
                    Some(q) => q.name(),
                    None => String::new(),
                };
                let mut resp = Message::reply_to(ctx.query());
                resp.answers.push(Record::a(&name, ttl, addr));
                ctx.set_response(resp);
                Ok(())
            }
        }
    }
}
