use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{ConsumerHandle, Handler, Queue, Result};

/// In-process queue for embedded runs and tests.
///
/// Every consumer group observes every emitted message; within one group the
/// consumers compete, served round-robin. Messages emitted while a group has
/// no consumer are not retained for it.
pub struct MemoryQueue<T> {
    groups: Mutex<HashMap<String, GroupState<T>>>,
}

struct GroupState<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
    next: usize,
}

impl<T> MemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Queue<T> for MemoryQueue<T>
where
    T: Clone + Send + 'static,
{
    async fn emit(&self, message: T) -> Result<()> {
        let mut groups = self.groups.lock().expect("queue lock poisoned");

        if groups.is_empty() {
            trace!("emitting without any consumer group, message dropped");
            return Ok(());
        }

        for group in groups.values_mut() {
            // drop consumers whose receiving task has gone away
            group.senders.retain(|sender| !sender.is_closed());

            if group.senders.is_empty() {
                continue;
            }

            let index = group.next % group.senders.len();
            group.next = group.next.wrapping_add(1);

            // the receiver can only close between retain and send; losing
            // the message then matches at-least-once semantics for a
            // consumer that is gone
            let _ = group.senders[index].send(message.clone());
        }

        Ok(())
    }

    fn receive(&self, consumer_group: &str, handler: Handler<T>) -> ConsumerHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel::<T>();

        {
            let mut groups = self.groups.lock().expect("queue lock poisoned");
            groups
                .entry(consumer_group.to_string())
                .or_insert_with(|| GroupState {
                    senders: Vec::new(),
                    next: 0,
                })
                .senders
                .push(sender);
        }

        let token = CancellationToken::new();
        let consumer_token = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = consumer_token.cancelled() => break,
                    message = receiver.recv() => {
                        match message {
                            Some(message) => handler(message).await,
                            None => break,
                        }
                    }
                }
            }
        });

        ConsumerHandle::new(token)
    }
}
