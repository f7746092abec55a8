//! NAL streaming — H.264-over-UDP sender/receiver engines
//!
//! Packetizes H.264 NAL units into an RTP-like wire format under bitrate
//! and latency bounds, and reassembles them on the receiving side, with a
//! reference-counted buffer pool for fanning completed NALs out to
//! additional resenders.

pub mod clock;
pub mod config;
pub mod error;
pub mod fifo;
pub mod monitor;
pub mod nal;
pub mod pool;
pub mod receiver;
pub mod resender;
pub mod sender;
pub mod transport;
pub mod wire;

pub use config::{ReceiverConfig, ResenderConfig, SenderConfig};
pub use error::{Result, StreamError};
pub use monitor::{MonitoringStats, DEFAULT_CAPACITY};
pub use nal::CallbackStatus;
pub use pool::{NalBufferPool, PoolHandle};
pub use receiver::{BufferCause, BufferEvent, NalSink, Receiver, ResenderSink};
pub use resender::Resender;
pub use sender::{AuCallback, NalCallback, Sender};
