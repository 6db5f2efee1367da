//! Bounded, blocking, thread-safe FIFO of handles.
//!
//! Push blocks while full, pop blocks while empty, both with an optional
//! timeout (`None` waits forever). `try_pop` never blocks. Ownership of a
//! handle transfers from pusher to popper. One mutex protects a ring
//! buffer (`VecDeque` here); two counting semaphores gate push/pop so
//! neither side ever spins — mirroring the original `ptr_fifo`'s
//! push-semaphore/pop-semaphore pair, collapsed onto `tokio::sync::Semaphore`
//! per the "semaphores named via random filesystem IDs" design note (no
//! named POSIX semaphore needed in-process).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, TryAcquireError};

#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    Timeout,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PopError {
    Timeout,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Empty;

pub struct Fifo<T> {
    buffer: Mutex<VecDeque<T>>,
    free_slots: Semaphore,
    filled_slots: Semaphore,
}

impl<T> Fifo<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "fifo capacity can't be null");
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            free_slots: Semaphore::new(capacity),
            filled_slots: Semaphore::new(0),
        }
    }

    /// Push `item`, blocking while the fifo is full. `timeout` of `None`
    /// waits forever.
    pub async fn push(&self, item: T, timeout: Option<Duration>) -> Result<(), PushError> {
        let permit = match timeout {
            None => self
                .free_slots
                .acquire()
                .await
                .expect("fifo semaphore never closed"),
            Some(d) => match tokio::time::timeout(d, self.free_slots.acquire()).await {
                Ok(permit) => permit.expect("fifo semaphore never closed"),
                Err(_) => return Err(PushError::Timeout),
            },
        };
        permit.forget();

        {
            let mut buffer = self.buffer.lock().await;
            buffer.push_back(item);
        }
        self.filled_slots.add_permits(1);
        Ok(())
    }

    /// Pop the oldest item, blocking while the fifo is empty. `timeout`
    /// of `None` waits forever.
    pub async fn pop(&self, timeout: Option<Duration>) -> Result<T, PopError> {
        let permit = match timeout {
            None => self
                .filled_slots
                .acquire()
                .await
                .expect("fifo semaphore never closed"),
            Some(d) => match tokio::time::timeout(d, self.filled_slots.acquire()).await {
                Ok(permit) => permit.expect("fifo semaphore never closed"),
                Err(_) => return Err(PopError::Timeout),
            },
        };
        permit.forget();

        let item = {
            let mut buffer = self.buffer.lock().await;
            buffer
                .pop_front()
                .expect("filled_slots permit implies a queued item")
        };
        self.free_slots.add_permits(1);
        Ok(item)
    }

    /// Non-blocking pop; returns `Empty` immediately if nothing is queued.
    pub async fn try_pop(&self) -> Result<T, Empty> {
        match self.filled_slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                let item = {
                    let mut buffer = self.buffer.lock().await;
                    buffer
                        .pop_front()
                        .expect("filled_slots permit implies a queued item")
                };
                self.free_slots.add_permits(1);
                Ok(item)
            }
            Err(TryAcquireError::NoPermits) => Err(Empty),
            Err(TryAcquireError::Closed) => unreachable!("fifo semaphore never closed"),
        }
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let fifo = Fifo::new(4);
        for i in 0..4 {
            fifo.push(i, None).await.unwrap();
        }
        for i in 0..4 {
            assert_eq!(fifo.pop(None).await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn try_pop_on_empty_is_empty() {
        let fifo: Fifo<u32> = Fifo::new(2);
        assert_eq!(fifo.try_pop().await, Err(Empty));
    }

    #[tokio::test]
    async fn push_times_out_when_full() {
        let fifo = Fifo::new(2);
        fifo.push(1, None).await.unwrap();
        fifo.push(2, None).await.unwrap();
        let err = fifo
            .push(3, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err, PushError::Timeout);
        // state is uncorrupted: a pop still yields the first pushed element
        assert_eq!(fifo.pop(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let fifo: Fifo<u32> = Fifo::new(2);
        let err = fifo.pop(Some(Duration::from_millis(50))).await.unwrap_err();
        assert_eq!(err, PopError::Timeout);
    }

    #[tokio::test]
    async fn wraps_around_ring_boundary() {
        let fifo = Fifo::new(2);
        fifo.push(1, None).await.unwrap();
        fifo.push(2, None).await.unwrap();
        assert_eq!(fifo.pop(None).await.unwrap(), 1);
        fifo.push(3, None).await.unwrap();
        assert_eq!(fifo.pop(None).await.unwrap(), 2);
        assert_eq!(fifo.pop(None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_pushes_preserve_total_ordering() {
        use std::sync::Arc;
        let fifo = Arc::new(Fifo::new(64));
        let mut handles = vec![];
        for i in 0..64u32 {
            let fifo = fifo.clone();
            handles.push(tokio::spawn(async move {
                fifo.push(i, None).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let mut popped = vec![];
        for _ in 0..64 {
            popped.push(fifo.pop(None).await.unwrap());
        }
        popped.sort();
        assert_eq!(popped, (0..64).collect::<Vec<_>>());
    }
}
