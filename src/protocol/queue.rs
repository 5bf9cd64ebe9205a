use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// The queue was closed before the requested number of bytes arrived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("queue is closed")]
pub struct QueueClosed;

struct QueueState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// Blocking byte FIFO between the socket read loop and a protocol decode
/// thread. The producer appends whatever chunk the socket handed it; the
/// consumer asks for exact protocol-frame lengths and parks until they
/// are available. Closing the queue wakes every parked reader.
pub struct ByteQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ByteQueue {
    pub fn new() -> Self {
        ByteQueue {
            state: Mutex::new(QueueState {
                buf: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append bytes to the queue. Writes after close are dropped; the
    /// read loop can race the handler teardown and there is nobody left
    /// to consume them.
    pub fn put(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.buf.extend(data);
        self.available.notify_all();
    }

    /// Remove exactly `n` bytes, blocking until that many are available.
    /// Bytes buffered before a close are still delivered; a close with
    /// fewer than `n` bytes buffered fails. Never returns a short read.
    pub fn get(&self, n: usize) -> Result<Vec<u8>, QueueClosed> {
        let mut state = self.state.lock().unwrap();

        loop {
            if state.buf.len() >= n {
                return Ok(state.buf.drain(..n).collect());
            }
            if state.closed {
                return Err(QueueClosed);
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Close the queue, unblocking any reader parked in `get`.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.available.notify_all();
    }
}

impl Default for ByteQueue {
    fn default() -> Self {
        ByteQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_get_exact_bytes() {
        let queue = ByteQueue::new();
        queue.put(&[1, 2, 3, 4, 5]);

        assert_eq!(queue.get(2).unwrap(), vec![1, 2]);
        assert_eq!(queue.get(3).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_get_blocks_until_available() {
        let queue = Arc::new(ByteQueue::new());
        queue.put(&[0xaa]);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get(4))
        };

        // Feed the remaining bytes in two late chunks.
        thread::sleep(Duration::from_millis(20));
        queue.put(&[0xbb, 0xcc]);
        thread::sleep(Duration::from_millis(20));
        queue.put(&[0xdd, 0xee]);

        assert_eq!(consumer.join().unwrap().unwrap(), vec![0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(queue.get(1).unwrap(), vec![0xee]);
    }

    #[test]
    fn test_close_unblocks_reader_with_error() {
        let queue = Arc::new(ByteQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get(16))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(consumer.join().unwrap(), Err(QueueClosed));
    }

    #[test]
    fn test_closed_with_insufficient_bytes_fails() {
        let queue = ByteQueue::new();
        queue.put(&[1, 2]);
        queue.close();

        // Never a short result.
        assert_eq!(queue.get(3), Err(QueueClosed));
    }

    #[test]
    fn test_closed_with_buffered_bytes_still_delivers() {
        let queue = ByteQueue::new();
        queue.put(&[1, 2, 3]);
        queue.close();

        assert_eq!(queue.get(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(queue.get(1), Err(QueueClosed));
    }

    #[test]
    fn test_put_after_close_is_dropped() {
        let queue = ByteQueue::new();
        queue.close();
        queue.put(&[1, 2, 3]);

        assert_eq!(queue.get(1), Err(QueueClosed));
    }

    #[test]
    fn test_split_deliveries_reassemble() {
        let queue = ByteQueue::new();
        for b in 0u8..10 {
            queue.put(&[b]);
        }

        assert_eq!(queue.get(10).unwrap(), (0u8..10).collect::<Vec<_>>());
    }
}
