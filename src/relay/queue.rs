//! 클라이언트별 송신 큐
//!
//! - 낮은 priority 값이 먼저 나감
//! - 같은 priority 안에서는 FIFO
//! - 가득 차면 새 메시지를 버림 (느린 클라이언트가 다른 쪽을 막지 않도록)

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub priority: u8,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<Outbound>,
    closed: bool,
}

pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    ready: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            ready: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // 잠금 구간에서 panic할 코드가 없으므로 poison은 무시
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Never waits.
    pub fn try_push(&self, priority: u8, line: impl Into<String>) -> Result<(), PushError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PushError::Closed);
        }
        if inner.items.len() >= self.capacity {
            return Err(PushError::Full);
        }

        // 우선순위에 따라 삽입 위치 결정
        let pos = inner
            .items
            .iter()
            .position(|o| o.priority > priority)
            .unwrap_or(inner.items.len());
        inner.items.insert(
            pos,
            Outbound {
                priority,
                line: line.into(),
            },
        );
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Next item, or `None` once closed. Items still queued at close are discarded.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
            }
            self.ready.notified().await;
        }
    }

    /// Closes the queue and returns how many items were left.
    pub fn close(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let left = inner.items.len();
        inner.items.clear();
        drop(inner);
        self.ready.notify_one();
        left
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let q = OutboundQueue::new(8);
        q.try_push(5, "a").unwrap();
        q.try_push(1, "urgent").unwrap();
        q.try_push(5, "b").unwrap();
        q.try_push(9, "late").unwrap();
        q.try_push(1, "urgent2").unwrap();

        let mut order = Vec::new();
        while !q.is_empty() {
            order.push(q.pop().await.unwrap().line);
        }
        assert_eq!(order, vec!["urgent", "urgent2", "a", "b", "late"]);
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let q = OutboundQueue::new(24);
        let accepted = (0..100)
            .filter(|i| q.try_push(5, format!("line {}", i)).is_ok())
            .count();
        assert_eq!(accepted, 24);
        assert_eq!(q.len(), 24);
        assert_eq!(q.try_push(0, "vip"), Err(PushError::Full));
    }

    #[tokio::test]
    async fn test_slow_consumer_gets_at_most_capacity() {
        let q = Arc::new(OutboundQueue::new(4));
        for i in 0..50 {
            let _ = q.try_push(5, format!("{}", i));
        }
        let mut got = Vec::new();
        while let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(50), q.pop()).await {
            got.push(item.line);
        }
        assert_eq!(got, vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_and_close() {
        let q = Arc::new(OutboundQueue::new(4));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.try_push(5, "hello").unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().line, "hello");

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.close(), 0);
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(q.try_push(5, "x"), Err(PushError::Closed));
    }
}
