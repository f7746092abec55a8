//! Socket setup (§4.3 "Socket setup", §4.4.2) for sender and receiver
//! engines. Plain `std::net::UdpSocket` handles send/recv; `socket2` is
//! used only for the setup knobs `std::net` doesn't expose (multicast
//! group join, explicit kernel buffer sizing, `SO_REUSEADDR`).

use crate::config::{ReceiverConfig, SenderConfig};
use crate::error::{Result, StreamError};
use logging::Logger;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

/// Socket send buffer / FIFO bitrate-governor target (§4.3): half the
/// bitrate*latency budget goes to the kernel buffer, half to the FIFO.
pub fn socket_buffer_target_bytes(max_bitrate: u64, max_network_latency_ms: u32) -> usize {
    ((max_bitrate as u128 * max_network_latency_ms as u128) / 1000 / 8 / 2) as usize
}

fn is_multicast(addr: &str) -> bool {
    addr.parse::<Ipv4Addr>().map(|v4| v4.is_multicast()).unwrap_or(false)
}

/// A sender-side socket, bound either to a connected unicast peer
/// (`send()`) or to a multicast source interface (`send_to()`).
pub struct SenderSocket {
    socket: UdpSocket,
    target: Option<SocketAddr>,
}

impl SenderSocket {
    pub fn send(&self, data: &[u8]) -> std::io::Result<usize> {
        match self.target {
            Some(addr) => self.socket.send_to(data, addr),
            None => self.socket.send(data),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        self.socket.set_nonblocking(nonblocking)
    }
}

pub fn setup_sender_socket(cfg: &SenderConfig, logger: &Logger) -> Result<SenderSocket> {
    let buffer_target = socket_buffer_target_bytes(cfg.max_bitrate, cfg.max_network_latency_ms);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| StreamError::AllocFailed(format!("socket create: {}", e)))?;
    socket
        .set_send_buffer_size(buffer_target)
        .map_err(|e| StreamError::AllocFailed(format!("set send buffer: {}", e)))?;

    let target: SocketAddr = format!("{}:{}", cfg.send_addr, cfg.send_port)
        .parse()
        .map_err(|_| StreamError::BadParameters("invalid send address/port".into()))?;

    let socket = if is_multicast(&cfg.send_addr) {
        let bind_ip = cfg.iface_ip().unwrap_or(Ipv4Addr::UNSPECIFIED.into());
        let bind_addr: SocketAddr = SocketAddr::new(bind_ip, 0);
        socket
            .bind(&bind_addr.into())
            .map_err(|e| StreamError::AllocFailed(format!("bind: {}", e)))?;
        logger.info(&format!(
            "sender socket bound to {} for multicast group {}",
            bind_addr, target
        ));
        SenderSocket {
            socket: socket.into(),
            target: Some(target),
        }
    } else {
        socket
            .bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0).into())
            .map_err(|e| StreamError::AllocFailed(format!("bind: {}", e)))?;
        let std_socket: UdpSocket = socket.into();
        std_socket
            .connect(target)
            .map_err(|e| StreamError::AllocFailed(format!("connect: {}", e)))?;
        logger.info(&format!("sender socket connected to {}", target));
        SenderSocket {
            socket: std_socket,
            target: None,
        }
    };

    socket.set_nonblocking(true)?;
    Ok(socket)
}

pub fn setup_receiver_socket(cfg: &ReceiverConfig, logger: &Logger) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| StreamError::AllocFailed(format!("socket create: {}", e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| StreamError::AllocFailed(format!("set reuse addr: {}", e)))?;

    if cfg.is_multicast() {
        let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), cfg.recv_port as u16);
        socket
            .bind(&bind_addr.into())
            .map_err(|e| StreamError::AllocFailed(format!("bind: {}", e)))?;

        let group = match cfg.recv_ip() {
            Some(std::net::IpAddr::V4(v4)) => v4,
            _ => return Err(StreamError::BadParameters("multicast recv_addr must be IPv4".into())),
        };
        let iface = match cfg.iface_ip() {
            Some(std::net::IpAddr::V4(v4)) => v4,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        socket
            .join_multicast_v4(&group, &iface)
            .map_err(|e| StreamError::AllocFailed(format!("join multicast: {}", e)))?;
        logger.info(&format!("receiver joined multicast group {} on {}", group, iface));
    } else {
        let bind_ip = cfg.iface_ip().unwrap_or(Ipv4Addr::UNSPECIFIED.into());
        let bind_addr = SocketAddr::new(bind_ip, cfg.recv_port as u16);
        socket
            .bind(&bind_addr.into())
            .map_err(|e| StreamError::AllocFailed(format!("bind: {}", e)))?;
        logger.info(&format!("receiver socket bound to {}", bind_addr));
    }

    socket
        .set_recv_buffer_size(cfg.recv_buffer_size as usize)
        .map_err(|e| StreamError::AllocFailed(format!("set recv buffer: {}", e)))?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}
