/// Per-connection outbound buffer with a drop-oldest overflow policy.
///
/// The session relay pushes without ever waiting; a connection that stops
/// reading loses its oldest undelivered events instead of stalling the
/// relay or the other connections.
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::service::session::SessionEvent;

struct QueueState {
    events: VecDeque<SessionEvent>,
    closed: bool,
    dropped: u64,
}

struct Shared {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Smallest queue that holds the size and history pushed on attach.
const MIN_CAPACITY: usize = 2;

/// Create a queue holding at most `capacity` events (minimum 2).
pub(crate) fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let shared = Arc::new(Shared {
        capacity: capacity.max(MIN_CAPACITY),
        state: Mutex::new(QueueState {
            events: VecDeque::new(),
            closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
    });
    (
        OutboundSender {
            shared: shared.clone(),
        },
        OutboundReceiver { shared },
    )
}

/// Session side of an outbound queue.
pub(crate) struct OutboundSender {
    shared: Arc<Shared>,
}

impl OutboundSender {
    /// Queue `event`, evicting the oldest one when full. Returns how many
    /// events were evicted. Pushing to a closed queue does nothing.
    pub(crate) fn push(&self, event: SessionEvent) -> usize {
        let evicted = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return 0;
            }
            let evicted = make_room(&mut state, self.shared.capacity);
            state.events.push_back(event);
            evicted
        };
        self.shared.notify.notify_one();
        evicted
    }

    /// Queue a final event and close. The final event is never evicted.
    pub(crate) fn close_with(&self, event: SessionEvent) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            make_room(&mut state, self.shared.capacity);
            state.events.push_back(event);
            state.closed = true;
        }
        self.shared.notify.notify_one();
    }

    /// Close without a final event.
    pub(crate) fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

fn make_room(state: &mut QueueState, capacity: usize) -> usize {
    let mut evicted = 0;
    while state.events.len() >= capacity {
        state.events.pop_front();
        state.dropped += 1;
        evicted += 1;
    }
    evicted
}

/// Connection side of an outbound queue.
pub struct OutboundReceiver {
    shared: Arc<Shared>,
}

impl OutboundReceiver {
    /// Next event; `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.shared.state.lock().events.pop_front()
    }

    /// Events evicted from this queue because the connection fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the session has closed this queue.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl std::fmt::Debug for OutboundReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("OutboundReceiver")
            .field("queued", &state.events.len())
            .field("dropped", &state.dropped)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyExit;
    use bytes::Bytes;

    fn output(text: &'static str) -> SessionEvent {
        SessionEvent::Output(Bytes::from_static(text.as_bytes()))
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (tx, mut rx) = outbound_channel(2);
        assert_eq!(tx.push(output("a")), 0);
        assert_eq!(tx.push(output("b")), 0);
        assert_eq!(tx.push(output("c")), 1);

        assert_eq!(rx.recv().await, Some(output("b")));
        assert_eq!(rx.recv().await, Some(output("c")));
        assert_eq!(rx.dropped(), 1);
    }

    #[tokio::test]
    async fn final_event_survives_a_full_queue() {
        let (tx, mut rx) = outbound_channel(2);
        tx.push(output("a"));
        tx.push(output("b"));
        tx.close_with(SessionEvent::Exited(PtyExit::with_code(0)));
        tx.push(output("ignored"));

        assert_eq!(rx.recv().await, Some(output("b")));
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Exited(PtyExit::with_code(0)))
        );
        assert_eq!(rx.recv().await, None);
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn recv_wakes_on_push_from_another_task() {
        let (tx, mut rx) = outbound_channel(4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.push(output("late"));
        assert_eq!(handle.await.unwrap(), Some(output("late")));
    }
}
