use smallvec::SmallVec;
use std::time::Duration;
use tokio::time::Instant;

use crate::message::Message;

/// Mutable per-request state threaded through the stage chain.
///
/// A context is owned by the task driving one request. Stages that need
/// out-of-band work (lazy refresh, fallback branches) take a [`fork`]
/// which shares no mutable state with the original.
///
/// [`fork`]: QueryContext::fork
#[derive(Debug)]
pub struct QueryContext {
    query: Message,
    response: Option<Message>,
    marks: SmallVec<[u32; 4]>,
    deadline: Option<Instant>,
    served_from_cache: bool,
}

impl QueryContext {
    pub fn new(query: Message) -> Self {
        QueryContext {
            query,
            response: None,
            marks: SmallVec::new(),
            deadline: None,
            served_from_cache: false,
        }
    }

    pub fn query(&self) -> &Message {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut Message {
        &mut self.query
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Message> {
        self.response.as_mut()
    }

    pub fn set_response(&mut self, response: Message) {
        self.response = Some(response);
        self.served_from_cache = false;
    }

    /// Set a response that was served from a cache. Distinguished so the
    /// cache stage does not re-store its own answer on unwind.
    pub fn set_cached_response(&mut self, response: Message) {
        self.response = Some(response);
        self.served_from_cache = true;
    }

    pub fn take_response(&mut self) -> Option<Message> {
        self.served_from_cache = false;
        self.response.take()
    }

    pub fn served_from_cache(&self) -> bool {
        self.served_from_cache
    }

    pub fn set_mark(&mut self, mark: u32) {
        if !self.has_mark(mark) {
            self.marks.push(mark);
        }
    }

    pub fn has_mark(&self, mark: u32) -> bool {
        self.marks.contains(&mark)
    }

    pub fn marks(&self) -> &[u32] {
        &self.marks
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Copy for out-of-band work: query and marks carry over, response,
    /// cache flag and deadline do not.
    pub fn fork(&self) -> QueryContext {
        QueryContext {
            query: self.query.clone(),
            response: None,
            marks: self.marks.clone(),
            deadline: None,
            served_from_cache: false,
        }
    }
}

/// Deadline for a sub-task: the outer request's deadline when present,
/// otherwise now plus the stage-local default.
pub(crate) fn bounded_deadline(outer: Option<Instant>, default_timeout: Duration) -> Instant {
    outer.unwrap_or_else(|| Instant::now() + default_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, RecordType};

    #[test]
    fn fork_shares_nothing_mutable() {
        let mut ctx = QueryContext::new(Message::query("example.com", RecordType::A));
        ctx.set_mark(7);
        ctx.set_response(Message::default());
        ctx.set_deadline(Instant::now());

        let fork = ctx.fork();
        assert!(fork.has_mark(7));
        assert!(fork.response().is_none());
        assert!(fork.deadline().is_none());
        assert!(!fork.served_from_cache());
    }

    #[test]
    fn set_response_clears_cache_flag() {
        let mut ctx = QueryContext::new(Message::query("example.com", RecordType::A));
        ctx.set_cached_response(Message::default());
        assert!(ctx.served_from_cache());
        ctx.set_response(Message::default());
        assert!(!ctx.served_from_cache());
    }
}
