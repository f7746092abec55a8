//! Resender (§4.5): re-transmits NALs handed off by a receiver's fan-out
//! through its own, independently configured [`Sender`].
//!
//! A resender shares nothing with the receiver but the [`PoolHandle`] it is
//! handed — no socket, no FIFO, no monitoring ring. Its `ResenderSink`
//! closure clones the handle (bumping the pool entry's reference count)
//! and copies the payload once into its own sender's FIFO; the handle
//! drops (and releases its reference) as soon as the closure returns.

use crate::config::ResenderConfig;
use crate::error::Result;
use crate::monitor::MonitoringStats;
use crate::pool::PoolHandle;
use crate::receiver::ResenderSink;
use crate::sender::Sender;
use logging::Logger;
use std::sync::Arc;

/// One additional outbound feed wired to a receiver's reassembled stream.
/// NAL/AU tags are meaningless for a re-transmitted stream, so the
/// underlying sender is instantiated with `()` as its tag type.
pub struct Resender {
    sender: Arc<Sender<()>>,
}

impl Resender {
    /// Builds the resender's own sender and the callback a [`Receiver`](crate::receiver::Receiver)
    /// should register via `add_resender`. The caller owns both ends: drop
    /// the returned `Resender` and deregister its sink to tear it down.
    pub fn new(cfg: ResenderConfig, logger: Logger) -> Result<(Self, ResenderSink)> {
        let sender = Arc::new(Sender::<()>::new(cfg.sender, logger, None, None)?);
        let sink_sender = sender.clone();
        let sink: ResenderSink = Arc::new(move |handle: PoolHandle| {
            let _ = sink_sender.submit(Arc::from(handle.payload()), handle.au_timestamp_us(), handle.last_in_au(), false, (), ());
        });
        Ok((Resender { sender }, sink))
    }

    pub fn monitoring(&self, start_time_us: u64, window_us: u64, with_stddev: bool) -> MonitoringStats {
        self.sender.monitoring(start_time_us, window_us, with_stddev)
    }

    pub fn set_bitrate_and_latency(&self, max_bitrate: u64, max_latency_ms: u32, max_network_latency_ms: u32) -> Result<()> {
        self.sender.set_bitrate_and_latency(max_bitrate, max_latency_ms, max_network_latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SenderConfig;
    use logging::LogLevel;
    use std::net::UdpSocket;
    use tempfile::tempdir;

    fn test_logger() -> Logger {
        let dir = tempdir().unwrap();
        Logger::new(dir.path().join("test.log"), LogLevel::Debug).unwrap()
    }

    #[test]
    fn resender_forwards_pool_handle_payload() {
        let receiver_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver_socket.local_addr().unwrap().port();

        let cfg = ResenderConfig {
            sender: SenderConfig {
                send_addr: "127.0.0.1".to_string(),
                send_port: port as u32,
                fifo_size: 8,
                ..Default::default()
            },
        };
        let (resender, sink) = Resender::new(cfg, test_logger()).unwrap();

        let pool = crate::pool::NalBufferPool::new(4, 64);
        let handle = pool.acquire(&[0x65, 1, 2, 3], crate::clock::now_us(), true).unwrap();
        sink(handle);

        receiver_socket.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 256];
        let (n, _) = receiver_socket.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[crate::wire::HEADER_SIZE..n], &[0x65, 1, 2, 3]);

        let stats = resender.monitoring(0, 10_000_000, false);
        assert_eq!(stats.packets_sent, 1);
    }
}
