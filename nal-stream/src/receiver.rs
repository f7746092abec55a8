//! Receiver engine (§4.4): depacketizes incoming datagrams, tracks
//! access-unit boundaries and sequence-number gaps, and drives the
//! consumer's pull-based buffer handoff (§4.4.1).

use crate::clock;
use crate::config::ReceiverConfig;
use crate::error::{Result, StreamError};
use crate::monitor::{MonitorEvent, MonitoringRing, MonitoringStats, DEFAULT_CAPACITY};
use crate::pool::NalBufferPool;
use crate::transport;
use crate::wire::{self, PacketHeader, FU_A_TYPE, STAP_A_TYPE};
use logging::Logger;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Why the receiver is invoking the consumer's buffer-handoff callback
/// (§4.4.1, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCause {
    /// A NAL finished reassembling; `bytes` holds the whole thing.
    Complete,
    /// The current buffer can't hold the next write; `bytes` holds what
    /// has been accumulated so far and must be carried into a new one.
    BufferTooSmall,
    /// The partial NAL was copied into the new buffer; `bytes` is the old
    /// buffer's contents, now safe to free/recycle.
    CopyComplete,
    /// The consumer declined (returned `None` or too-small) to `Complete`
    /// or `BufferTooSmall`; the in-progress NAL is discarded.
    Cancel,
}

/// One call of the receiver NAL callback (§3 "Callbacks").
pub struct BufferEvent<'a> {
    pub cause: BufferCause,
    pub bytes: &'a [u8],
    pub size_hint: usize,
    pub au_timestamp_us: u64,
    pub is_first: bool,
    pub is_last: bool,
    pub missing_before: u32,
}

/// Consumer-supplied buffer source: returns a buffer of at least
/// `size_hint` bytes, or `None` to cancel delivery of the in-progress NAL.
pub type NalSink = Arc<dyn Fn(BufferEvent) -> Option<Vec<u8>> + Send + Sync>;

/// Invoked once per fully-reassembled NAL, handing the resender fan-out a
/// reference-counted copy independent of the consumer's own buffer.
pub type ResenderSink = Arc<dyn Fn(crate::pool::PoolHandle) + Send + Sync>;

/// Opaque handle returned by `add_resender`, passed back to `remove_resender`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResenderHandle(u64);

struct OutBuffer {
    data: Vec<u8>,
    filled: usize,
}

struct FuReassembly {
    nal_header: u8,
    is_first: bool,
}

struct ReceiverRunState {
    stop: AtomicBool,
    /// Cleared by `receive_loop` just before it returns, for the
    /// non-blocking `close()`.
    running: AtomicBool,
    /// Set by `invalidate_buffer`; consumed (and cleared) once by
    /// `receive_loop` on the next packet, forcing the handoff buffer to be
    /// treated as zero-capacity so the next write re-triggers
    /// `BufferTooSmall` instead of reusing stale contents.
    invalidate: AtomicBool,
}

pub struct Receiver {
    pool: Arc<NalBufferPool>,
    monitor: Arc<MonitoringRing>,
    run_state: Arc<ReceiverRunState>,
    resenders: Arc<Mutex<Vec<(u64, ResenderSink)>>>,
    next_resender_id: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl Receiver {
    pub fn new(cfg: ReceiverConfig, logger: Logger, sink: NalSink) -> Result<Self> {
        if cfg.max_packet_size == 0 {
            return Err(StreamError::BadParameters("max_packet_size must be > 0".into()));
        }
        let socket = transport::setup_receiver_socket(&cfg, &logger)?;
        let pool = NalBufferPool::new(64, 4096);
        let monitor = Arc::new(MonitoringRing::new(DEFAULT_CAPACITY));
        let run_state = Arc::new(ReceiverRunState {
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            invalidate: AtomicBool::new(false),
        });
        let resenders: Arc<Mutex<Vec<(u64, ResenderSink)>>> = Arc::new(Mutex::new(Vec::new()));
        let next_resender_id = Arc::new(AtomicU64::new(1));

        let thread_pool = pool.clone();
        let thread_monitor = monitor.clone();
        let thread_run_state = run_state.clone();
        let thread_resenders = resenders.clone();
        let thread_logger = logger.for_component("Receiver")?;
        let insert_start_codes = cfg.insert_start_codes;
        let max_packet_size = cfg.max_packet_size as usize;

        let thread = std::thread::Builder::new()
            .name("nal-receiver".into())
            .spawn(move || {
                receive_loop(
                    socket,
                    thread_pool,
                    thread_monitor,
                    thread_run_state,
                    thread_resenders,
                    sink,
                    thread_logger,
                    insert_start_codes,
                    max_packet_size,
                )
            })
            .map_err(|e| StreamError::AllocFailed(format!("spawn receiver thread: {}", e)))?;

        Ok(Receiver {
            pool,
            monitor,
            run_state,
            resenders,
            next_resender_id,
            thread: Some(thread),
        })
    }

    pub fn monitoring(&self, start_time_us: u64, window_us: u64, with_stddev: bool) -> MonitoringStats {
        self.monitor.query(start_time_us, window_us, with_stddev)
    }

    pub fn pool(&self) -> &Arc<NalBufferPool> {
        &self.pool
    }

    pub fn add_resender(&self, sink: ResenderSink) -> ResenderHandle {
        let id = self.next_resender_id.fetch_add(1, Ordering::Relaxed);
        self.resenders.lock().unwrap().push((id, sink));
        ResenderHandle(id)
    }

    /// Removes exactly the resender `add_resender` returned this handle
    /// for; a no-op if it was already removed.
    pub fn remove_resender(&self, handle: ResenderHandle) {
        self.resenders.lock().unwrap().retain(|(id, _)| *id != handle.0);
    }

    pub fn remove_all_resenders(&self) {
        self.resenders.lock().unwrap().clear();
    }

    /// Forces the consumer's too-small callback on the next packet
    /// delivered for the NAL currently being reassembled, discarding
    /// whatever has been buffered so far instead of reusing it.
    pub fn invalidate_buffer(&self) {
        self.run_state.invalidate.store(true, Ordering::Relaxed);
    }

    pub fn stop(&mut self) -> Result<()> {
        self.run_state.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| StreamError::Transport("receiver thread panicked".into()))?;
        }
        Ok(())
    }

    /// Non-blocking variant of `stop`: signals shutdown but returns `Busy`
    /// instead of joining if the depacketizer thread is still running.
    pub fn close(&mut self) -> Result<()> {
        self.run_state.stop.store(true, Ordering::Relaxed);
        if self.run_state.running.load(Ordering::Acquire) {
            return Err(StreamError::Busy);
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| StreamError::Transport("receiver thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.run_state.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Writes `bytes` (optionally prefixed by the Annex-B start code) into the
/// handoff buffer, requesting a bigger one via `sink` when it doesn't fit.
/// Returns `false` if the consumer cancelled the in-progress NAL.
fn append_to_handoff(
    out: &mut Option<OutBuffer>,
    sink: &NalSink,
    bytes: &[u8],
    prefix: &[u8],
    au_timestamp_us: u64,
    is_first: bool,
    is_last: bool,
    missing_before: u32,
) -> bool {
    let needed_extra = prefix.len() + bytes.len();
    let current_filled = out.as_ref().map(|b| b.filled).unwrap_or(0);
    let current_capacity = out.as_ref().map(|b| b.data.len()).unwrap_or(0);
    let needed_total = current_filled + needed_extra;

    if needed_total > current_capacity {
        let old = out.take();
        let partial: &[u8] = old.as_ref().map(|b| &b.data[..b.filled]).unwrap_or(&[]);
        let requested = sink(BufferEvent {
            cause: BufferCause::BufferTooSmall,
            bytes: partial,
            size_hint: needed_total,
            au_timestamp_us,
            is_first,
            is_last,
            missing_before,
        });

        match requested {
            Some(new_buf) if new_buf.len() >= needed_total => {
                let mut new_out = OutBuffer { data: new_buf, filled: current_filled };
                if let Some(old_buf) = &old {
                    new_out.data[..current_filled].copy_from_slice(&old_buf.data[..current_filled]);
                }
                if old.is_some() {
                    sink(BufferEvent {
                        cause: BufferCause::CopyComplete,
                        bytes: &old.as_ref().unwrap().data[..current_filled],
                        size_hint: 0,
                        au_timestamp_us,
                        is_first,
                        is_last,
                        missing_before,
                    });
                }
                *out = Some(new_out);
            }
            _ => {
                *out = None;
                sink(BufferEvent {
                    cause: BufferCause::Cancel,
                    bytes: &[],
                    size_hint: 0,
                    au_timestamp_us,
                    is_first,
                    is_last,
                    missing_before,
                });
                return false;
            }
        }
    }

    let buf = out.as_mut().unwrap();
    let start = buf.filled;
    buf.data[start..start + prefix.len()].copy_from_slice(prefix);
    buf.data[start + prefix.len()..start + prefix.len() + bytes.len()].copy_from_slice(bytes);
    buf.filled += needed_extra;
    true
}

#[allow(clippy::too_many_arguments)]
fn complete_nal(
    out: &mut Option<OutBuffer>,
    sink: &NalSink,
    pool: &Arc<NalBufferPool>,
    resenders: &Arc<Mutex<Vec<(u64, ResenderSink)>>>,
    au_timestamp_us: u64,
    is_first: bool,
    is_last: bool,
    missing_before: u32,
) {
    let Some(buf) = out.take() else { return };
    let next = sink(BufferEvent {
        cause: BufferCause::Complete,
        bytes: &buf.data[..buf.filled],
        size_hint: 0,
        au_timestamp_us,
        is_first,
        is_last,
        missing_before,
    });
    *out = next.map(|data| OutBuffer { data, filled: 0 });

    if let Ok(handle) = pool.acquire(&buf.data[..buf.filled], au_timestamp_us, is_last) {
        let targets = resenders.lock().unwrap();
        for (_, target) in targets.iter() {
            target(handle.clone());
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn receive_loop(
    socket: UdpSocket,
    pool: Arc<NalBufferPool>,
    monitor: Arc<MonitoringRing>,
    run_state: Arc<ReceiverRunState>,
    resenders: Arc<Mutex<Vec<(u64, ResenderSink)>>>,
    sink: NalSink,
    logger: Logger,
    insert_start_codes: bool,
    max_packet_size: usize,
) {
    let mut buf = vec![0u8; max_packet_size.max(wire::HEADER_SIZE) + 64];
    let mut out: Option<OutBuffer> = None;
    let mut fu_state: Option<FuReassembly> = None;

    let mut prev_sequence: Option<u16> = None;
    let mut current_au_timestamp: Option<u32> = None;
    let mut au_start_sequence: Option<u16> = None;
    let mut gap_counter: u32 = 0u32;
    let mut uncertain_au_change = false;
    let mut bytes_received_in_au = false;

    let mut first_timestamp: Option<u32> = None;
    let mut first_wall_us: u64 = 0;
    let mut last_transit: Option<i64> = None;
    let mut jitter_us: f64 = 0.0;

    while !run_state.stop.load(Ordering::Relaxed) {
        let (n, _src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            Err(e) => {
                logger.warn(&format!("recv failed: {}", e));
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
        };

        let wall = clock::now_us();
        let header = match PacketHeader::from_bytes(&buf[..n]) {
            Ok(h) => h,
            Err(_) => continue,
        };
        if n <= wire::HEADER_SIZE {
            continue;
        }
        let payload = &buf[wire::HEADER_SIZE..n];

        // Out-of-order detection happens before anything else is recorded
        // for this packet: a stale/duplicate packet with no reordering
        // buffer never reaches the monitoring ring at all.
        let mut missed_this_packet: u32 = 0;
        if let Some(prev) = prev_sequence {
            let mut delta = header.sequence_number as i32 - prev as i32;
            if delta < -32768 {
                delta += 65536;
            }
            if delta <= 0 {
                continue; // out of order, no reordering buffer
            }
            missed_this_packet = (delta - 1) as u32;
            gap_counter += missed_this_packet;
        }
        prev_sequence = Some(header.sequence_number);

        if first_timestamp.is_none() {
            first_timestamp = Some(header.timestamp);
            first_wall_us = wall;
        }
        let base_ts = first_timestamp.unwrap();
        let au_timestamp_us =
            first_wall_us + (header.timestamp.wrapping_sub(base_ts) as u64) * 1000 / 90;

        let transit = wall as i64 - au_timestamp_us as i64;
        if let Some(prev) = last_transit {
            let d = (transit - prev).unsigned_abs() as f64;
            jitter_us += (d - jitter_us) / 16.0;
        }
        last_transit = Some(transit);

        monitor.record(MonitorEvent {
            wall_time_us: wall,
            au_timestamp_us,
            sequence_number: header.sequence_number,
            marker: header.marker,
            bytes: n as u32,
            bytes_dropped: 0,
            network_transit_us: Some(transit),
            acquisition_to_network_us: None,
            jitter_us: Some(jitter_us),
            packets_missed: missed_this_packet,
        });

        if run_state.invalidate.swap(false, Ordering::Relaxed) {
            out = None;
        }

        if current_au_timestamp != Some(header.timestamp) {
            if bytes_received_in_au || gap_counter != 0 {
                uncertain_au_change = true;
            }
            gap_counter = 0;
            bytes_received_in_au = false;
            current_au_timestamp = Some(header.timestamp);
            au_start_sequence = Some(header.sequence_number);
            fu_state = None; // pending reassembly never survives an AU boundary
        }
        let seq_is_au_start = au_start_sequence == Some(header.sequence_number);

        if payload.is_empty() {
            continue;
        }
        let (_, nal_type) = wire::parse_nal_header(payload[0]);

        match nal_type {
            t if t == FU_A_TYPE => {
                if payload.len() < 2 {
                    continue;
                }
                let (nri, is_start, is_end, orig_type) = wire::parse_fu_a_prefix(payload[0], payload[1]);
                if is_start {
                    fu_state = Some(FuReassembly {
                        nal_header: wire::build_nal_header(nri, orig_type),
                        is_first: !uncertain_au_change && seq_is_au_start,
                    });
                    out = None;
                }
                let Some(state) = &fu_state else { continue };
                let fragment_prefix: &[u8] = if is_start { std::slice::from_ref(&state.nal_header) } else { &[] };
                let annex_b: &[u8] = if is_start && insert_start_codes { wire::NAL_START_CODE } else { &[] };
                let mut prefix = Vec::with_capacity(annex_b.len() + fragment_prefix.len());
                prefix.extend_from_slice(annex_b);
                prefix.extend_from_slice(fragment_prefix);

                let is_first = state.is_first;
                let body = &payload[2..];
                bytes_received_in_au = true;
                let ok = append_to_handoff(
                    &mut out,
                    &sink,
                    body,
                    &prefix,
                    au_timestamp_us,
                    is_first,
                    header.marker,
                    gap_counter,
                );
                if is_end {
                    if ok {
                        complete_nal(&mut out, &sink, &pool, &resenders, au_timestamp_us, is_first, header.marker, gap_counter);
                    }
                    fu_state = None;
                }
            }
            t if t == STAP_A_TYPE => {
                fu_state = None;
                match wire::parse_stap_a(&payload[1..]) {
                    Ok(nalus) => {
                        bytes_received_in_au = true;
                        for (i, nal) in nalus.iter().enumerate() {
                            let is_first = !uncertain_au_change && seq_is_au_start && i == 0;
                            let annex_b: &[u8] = if insert_start_codes { wire::NAL_START_CODE } else { &[] };
                            if append_to_handoff(&mut out, &sink, nal, annex_b, au_timestamp_us, is_first, header.marker, gap_counter) {
                                complete_nal(&mut out, &sink, &pool, &resenders, au_timestamp_us, is_first, header.marker, gap_counter);
                            }
                        }
                    }
                    Err(e) => logger.warn(&format!("malformed STAP-A: {}", e)),
                }
            }
            _ => {
                fu_state = None;
                bytes_received_in_au = true;
                let is_first = !uncertain_au_change && seq_is_au_start;
                let annex_b: &[u8] = if insert_start_codes { wire::NAL_START_CODE } else { &[] };
                if append_to_handoff(&mut out, &sink, payload, annex_b, au_timestamp_us, is_first, header.marker, gap_counter) {
                    complete_nal(&mut out, &sink, &pool, &resenders, au_timestamp_us, is_first, header.marker, gap_counter);
                }
            }
        }

        if header.marker {
            uncertain_au_change = false;
            gap_counter = 0;
        }
    }

    run_state.running.store(false, Ordering::Release);
}
