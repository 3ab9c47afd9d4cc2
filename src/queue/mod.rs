//! Queue abstraction for the orchestration engine.
//!
//! Subsystems communicate through durable queues with at-least-once
//! delivery: consumers must be idempotent, which is what drives the dedup
//! steps in the executor and the bookmark guards in the scheduler. The
//! in-memory transport here is the embedded/test implementation; relational
//! or broker transports live behind the same trait.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod memory;

pub use memory::MemoryQueue;

/// Queue layer error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The queue no longer accepts messages.
    #[error("queue is closed")]
    Closed,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Boxed future returned by message handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler invoked once per delivered message.
pub type Handler<T> = Arc<dyn Fn(T) -> HandlerFuture + Send + Sync>;

/// A registered consumer; cancelling stops delivery to its handler.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    token: CancellationToken,
}

impl ConsumerHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Durable queue contract: `emit` publishes, `receive` registers a consumer
/// within a group (each group observes every message, messages are load
/// balanced between the consumers of one group), `delete` acknowledges
/// messages on transports that track them.
#[async_trait]
pub trait Queue<T>: Send + Sync
where
    T: Clone + Send + 'static,
{
    async fn emit(&self, message: T) -> Result<()>;

    fn receive(&self, consumer_group: &str, handler: Handler<T>) -> ConsumerHandle;

    /// Acknowledge a message. The in-memory transport has nothing to track;
    /// log-table transports override this.
    async fn delete(&self, _message: &T) -> Result<()> {
        Ok(())
    }
}
