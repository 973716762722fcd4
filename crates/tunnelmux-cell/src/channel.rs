//! Logical byte stream inside a tunnel
//!
//! The tunnel reader is the only producer of a channel's receive buffer.
//! Each CHANNEL_DATA payload is appended whole, so a reader never sees a
//! partial frame. When the buffer is at its high-water mark the producer
//! waits for the consumer to drain it, which stalls the tunnel reader and
//! pushes backpressure through TLS to the agent.
//!
//! A frame is still accepted into an empty buffer even if it is larger than
//! the high-water mark; otherwise such a frame could never be delivered.

use std::sync::Weak;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use tunnelmux_common::{Error, Result};

use crate::tunnel::Tunnel;

/// Outcome of [`Channel::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Data can be read (or written, for the write side)
    Ready,
    /// Nothing became ready before the timeout
    Timeout,
    /// The channel is closed and drained
    Closed,
}

struct ReceiveBuffer {
    data: BytesMut,
    active: bool,
}

/// One logical byte stream, identified by a 32-bit id within its tunnel
pub struct Channel {
    id: u32,
    tunnel: Weak<Tunnel>,
    buffer: Mutex<ReceiveBuffer>,
    readable: Notify,
    space: Notify,
    high_water_mark: usize,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(id: u32, tunnel: Weak<Tunnel>, high_water_mark: usize) -> Self {
        Self {
            id,
            tunnel,
            buffer: Mutex::new(ReceiveBuffer {
                data: BytesMut::new(),
                active: true,
            }),
            readable: Notify::new(),
            space: Notify::new(),
            high_water_mark,
        }
    }

    /// Channel id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the channel is still open
    pub fn is_active(&self) -> bool {
        self.buffer.lock().active
    }

    /// Bytes received but not yet read
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().data.len()
    }

    /// Append one frame's payload, waiting while the buffer is full
    ///
    /// Returns false if the channel was shut down before the payload could
    /// be appended.
    pub(crate) async fn push(&self, payload: Bytes) -> bool {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut buf = self.buffer.lock();
                if !buf.active {
                    return false;
                }
                if buf.data.is_empty() || buf.data.len() + payload.len() <= self.high_water_mark {
                    buf.data.extend_from_slice(&payload);
                    trace!(channel_id = self.id, len = payload.len(), buffered = buf.data.len(), "Buffered channel data");
                    drop(buf);
                    self.readable.notify_waiters();
                    return true;
                }
            }

            trace!(channel_id = self.id, "Receive buffer full, waiting for reader");
            notified.await;
        }
    }

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for data
    ///
    /// Buffered data is returned even after the channel is closed. Once the
    /// channel is closed and drained, returns `Ok(0)`.
    pub async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut rb = self.buffer.lock();
                if !rb.data.is_empty() {
                    let n = buf.len().min(rb.data.len());
                    buf[..n].copy_from_slice(&rb.data[..n]);
                    rb.data.advance(n);
                    drop(rb);
                    self.space.notify_waiters();
                    return Ok(n);
                }
                if !rb.active {
                    return Ok(0);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::timeout(format!("channel {} read", self.id)));
            }
        }
    }

    /// Wait until the channel is readable (or writable, with `write_side`)
    ///
    /// Writability is immediate while the channel is active.
    pub async fn poll(&self, timeout: Duration, write_side: bool) -> PollResult {
        if write_side {
            return if self.is_active() {
                PollResult::Ready
            } else {
                PollResult::Closed
            };
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let rb = self.buffer.lock();
                if !rb.data.is_empty() {
                    return PollResult::Ready;
                }
                if !rb.active {
                    return PollResult::Closed;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return PollResult::Timeout;
            }
        }
    }

    /// Send `data` to the agent as one CHANNEL_DATA frame
    ///
    /// Returns the number of bytes sent, which is always `data.len()`.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.is_active() {
            return Err(Error::shutdown(format!("channel {}", self.id)));
        }
        let tunnel = self
            .tunnel
            .upgrade()
            .ok_or_else(|| Error::shutdown(format!("channel {}", self.id)))?;
        tunnel
            .send_channel_data(self.id, Bytes::copy_from_slice(data))
            .await
    }

    /// Close locally without telling the agent
    ///
    /// Wakes every waiting reader and the tunnel reader if it is blocked on
    /// this channel's buffer. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut buf = self.buffer.lock();
            if !buf.active {
                return;
            }
            buf.active = false;
        }
        debug!(channel_id = self.id, "Channel shut down");
        self.readable.notify_waiters();
        self.space.notify_waiters();
    }

    /// Close locally and send CLOSE_CHANNEL to the agent
    pub async fn close(&self) -> Result<()> {
        self.shutdown();
        match self.tunnel.upgrade() {
            Some(tunnel) => tunnel.close_channel(self.id).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn channel(hwm: usize) -> Arc<Channel> {
        Arc::new(Channel::new(1, Weak::new(), hwm))
    }

    #[tokio::test]
    async fn test_read_returns_buffered_data_in_order() {
        let ch = channel(1024);
        assert!(ch.push(Bytes::from_static(b"hello ")).await);
        assert!(ch.push(Bytes::from_static(b"world")).await);

        let mut buf = [0u8; 64];
        let n = ch
            .read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test]
    async fn test_read_partial_leaves_rest() {
        let ch = channel(1024);
        assert!(ch.push(Bytes::from_static(b"abcdef")).await);

        let mut buf = [0u8; 4];
        let n = ch
            .read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(ch.buffered_len(), 2);
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let ch = channel(1024);
        let mut buf = [0u8; 4];
        let err = ch
            .read(&mut buf, Duration::from_millis(20))
            .await
            .expect_err("read should time out");
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_reader() {
        let ch = channel(1024);
        let reader = {
            let ch = ch.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                ch.read(&mut buf, Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        ch.shutdown();
        let n = tokio::time::timeout(Duration::from_millis(100), reader)
            .await
            .expect("reader should wake promptly")
            .expect("reader task should complete")
            .expect("closed read should succeed");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_data_before_close_is_still_delivered() {
        let ch = channel(1024);
        assert!(ch.push(Bytes::from_static(b"tail")).await);
        ch.shutdown();

        let mut buf = [0u8; 8];
        let n = ch
            .read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");
        assert_eq!(&buf[..n], b"tail");
        let n = ch
            .read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");
        assert_eq!(n, 0);
    }

    /// Story: a full buffer stalls the producer until the consumer drains it
    #[tokio::test]
    async fn story_full_buffer_blocks_producer() {
        let ch = channel(8);
        assert!(ch.push(Bytes::from_static(b"12345678")).await);

        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.push(Bytes::from_static(b"9")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!producer.is_finished());
        assert_eq!(ch.buffered_len(), 8);

        let mut buf = [0u8; 4];
        ch.read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");

        let pushed = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should resume")
            .expect("producer task should complete");
        assert!(pushed);
        assert_eq!(ch.buffered_len(), 5);
    }

    #[tokio::test]
    async fn test_oversized_frame_accepted_into_empty_buffer() {
        let ch = channel(4);
        assert!(ch.push(Bytes::from_static(b"0123456789")).await);
        assert_eq!(ch.buffered_len(), 10);
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_producer() {
        let ch = channel(4);
        assert!(ch.push(Bytes::from_static(b"full")).await);
        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.push(Bytes::from_static(b"more")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        ch.shutdown();
        let pushed = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should wake")
            .expect("producer task should complete");
        assert!(!pushed);
    }

    #[tokio::test]
    async fn test_poll() {
        let ch = channel(1024);
        assert_eq!(ch.poll(Duration::from_millis(10), false).await, PollResult::Timeout);
        assert_eq!(ch.poll(Duration::from_millis(10), true).await, PollResult::Ready);

        assert!(ch.push(Bytes::from_static(b"x")).await);
        assert_eq!(ch.poll(Duration::from_millis(10), false).await, PollResult::Ready);

        let mut buf = [0u8; 1];
        ch.read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");
        ch.shutdown();
        assert_eq!(ch.poll(Duration::from_millis(10), false).await, PollResult::Closed);
        assert_eq!(ch.poll(Duration::from_millis(10), true).await, PollResult::Closed);
    }

    #[tokio::test]
    async fn test_write_on_closed_channel_fails() {
        let ch = channel(1024);
        ch.shutdown();
        let err = ch.write(b"data").await.expect_err("write should fail");
        assert!(matches!(err, Error::Shutdown { .. }));
    }

    #[tokio::test]
    async fn test_write_without_tunnel_fails() {
        let ch = channel(1024);
        let err = ch.write(b"data").await.expect_err("write should fail");
        assert!(matches!(err, Error::Shutdown { .. }));
    }
}
