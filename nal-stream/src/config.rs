//! Sender/receiver/resender configuration (§6).
//!
//! Plain structs with `Default` impls; JSON load/save is additive sugar on
//! top via `json_parser::impl_json!`, following the same pattern as
//! `RoomRtcConfig::load_from_file` in the original backend. Callbacks are
//! not part of the config struct — they are supplied separately to the
//! constructors since they cannot round-trip through JSON.

use crate::error::Result;
use json_parser::{from_str, impl_json};
use std::net::IpAddr;

/// Empty string means "unset" / `null` for the optional address fields.
fn parse_optional_addr(s: &str) -> Option<IpAddr> {
    if s.is_empty() { None } else { s.parse().ok() }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub send_addr: String,
    pub iface_addr: String,
    pub send_port: u32,
    pub fifo_size: u32,
    pub max_packet_size: u32,
    pub target_packet_size: u32,
    pub max_bitrate: u64,
    /// 0 disables the total-latency drop predicate.
    pub max_latency_ms: u32,
    pub max_network_latency_ms: u32,
    /// Upper bound on how many FU-A fragments one NAL may split into;
    /// `submit` rejects a NAL whose size implies more than this with
    /// `FrameTooLarge`.
    pub max_fragments_per_frame: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            send_addr: "127.0.0.1".to_string(),
            iface_addr: String::new(),
            send_port: 5004,
            fifo_size: 256,
            max_packet_size: 1400,
            target_packet_size: 1200,
            max_bitrate: 4_000_000,
            max_latency_ms: 200,
            max_network_latency_ms: 100,
            max_fragments_per_frame: 128,
        }
    }
}

impl_json! {
    SenderConfig {
        send_addr: String,
        iface_addr: String,
        send_port: u32,
        fifo_size: u32,
        max_packet_size: u32,
        target_packet_size: u32,
        max_bitrate: u64,
        max_latency_ms: u32,
        max_network_latency_ms: u32,
        max_fragments_per_frame: u32,
    }
}

impl SenderConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = config_loader::load_config_file(path)?;
        Ok(from_str(&content)?)
    }

    pub fn iface_ip(&self) -> Option<IpAddr> {
        parse_optional_addr(&self.iface_addr)
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub recv_addr: String,
    pub iface_addr: String,
    pub recv_port: u32,
    pub max_packet_size: u32,
    pub insert_start_codes: bool,
    pub recv_buffer_size: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            recv_addr: String::new(),
            iface_addr: String::new(),
            recv_port: 55004,
            max_packet_size: 1400,
            insert_start_codes: true,
            recv_buffer_size: 600 * 1024,
        }
    }
}

impl_json! {
    ReceiverConfig {
        recv_addr: String,
        iface_addr: String,
        recv_port: u32,
        max_packet_size: u32,
        insert_start_codes: bool,
        recv_buffer_size: u32,
    }
}

impl ReceiverConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = config_loader::load_config_file(path)?;
        Ok(from_str(&content)?)
    }

    pub fn recv_ip(&self) -> Option<IpAddr> {
        parse_optional_addr(&self.recv_addr)
    }

    pub fn iface_ip(&self) -> Option<IpAddr> {
        parse_optional_addr(&self.iface_addr)
    }

    pub fn is_multicast(&self) -> bool {
        match self.recv_ip() {
            Some(IpAddr::V4(v4)) => v4.is_multicast(),
            _ => false,
        }
    }
}

/// Union of sender and receiver configuration, used by `addResender`.
#[derive(Debug, Clone, Default)]
pub struct ResenderConfig {
    pub sender: SenderConfig,
}

impl_json! {
    ResenderConfig {
        sender: SenderConfig,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_config_defaults() {
        let cfg = SenderConfig::default();
        assert_eq!(cfg.send_port, 5004);
        assert_eq!(cfg.max_packet_size, 1400);
    }

    #[test]
    fn receiver_config_defaults() {
        let cfg = ReceiverConfig::default();
        assert_eq!(cfg.recv_port, 55004);
        assert!(cfg.insert_start_codes);
        assert!(!cfg.is_multicast());
    }

    #[test]
    fn receiver_config_detects_multicast() {
        let mut cfg = ReceiverConfig::default();
        cfg.recv_addr = "239.0.0.1".to_string();
        assert!(cfg.is_multicast());
    }

    #[test]
    fn sender_config_json_round_trip() {
        let cfg = SenderConfig {
            max_bitrate: 2_000_000,
            ..Default::default()
        };
        let json = json_parser::to_string(&cfg);
        let decoded: SenderConfig = from_str(&json).unwrap();
        assert_eq!(decoded.max_bitrate, 2_000_000);
        assert_eq!(decoded.send_port, cfg.send_port);
    }
}
