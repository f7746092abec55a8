//! Sender engine (§4.3): packetizes queued NAL units into wire packets,
//! governed by a bitrate/latency budget, and drives the NAL/AU callbacks.

use crate::clock;
use crate::config::SenderConfig;
use crate::error::{Result, StreamError};
use crate::fifo::NalFifo;
use crate::monitor::{MonitorEvent, MonitoringRing, MonitoringStats, DEFAULT_CAPACITY};
use crate::nal::{CallbackStatus, NalDescriptor};
use crate::transport::{self, SenderSocket};
use crate::wire::{self, PacketHeader, HEADER_SIZE};
use logging::Logger;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub type NalCallback<T> = Arc<dyn Fn(CallbackStatus, T) + Send + Sync>;
pub type AuCallback<T> = Arc<dyn Fn(CallbackStatus, T) + Send + Sync>;

/// Runtime-adjustable governor parameters, read from the packetizer thread
/// without taking the FIFO's mutex.
struct RunState {
    max_bitrate: AtomicU64,
    max_latency_ms: AtomicU32,
    max_network_latency_ms: AtomicU32,
    /// Cleared by the packetizer thread just before it returns, so a
    /// non-blocking `close()` can tell a finished thread from a busy one.
    running: AtomicBool,
}

/// A NAL emitted into the outgoing stream: sent as its own single/FU-A
/// packet set, or buffered here awaiting more members of a STAP-A
/// aggregate. `nal_tags` tracks every NAL folded into the aggregate so the
/// single wire-send outcome can be fanned back out to each one's callback.
struct AggState<T> {
    nalus: Vec<Arc<[u8]>>,
    nal_tags: Vec<T>,
    au_timestamp_us: u64,
    submit_time_us: u64,
    au_tag: T,
    size: usize,
}

pub struct Sender<T> {
    fifo: Arc<NalFifo<T>>,
    monitor: Arc<MonitoringRing>,
    run_state: Arc<RunState>,
    nal_callback: Option<NalCallback<T>>,
    au_callback: Option<AuCallback<T>>,
    max_frame_size: usize,
    thread: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + 'static> Sender<T> {
    pub fn new(
        cfg: SenderConfig,
        logger: Logger,
        nal_callback: Option<NalCallback<T>>,
        au_callback: Option<AuCallback<T>>,
    ) -> Result<Self> {
        if cfg.max_packet_size == 0 || cfg.target_packet_size == 0 {
            return Err(StreamError::BadParameters("packet sizes must be > 0".into()));
        }
        if cfg.target_packet_size > cfg.max_packet_size {
            return Err(StreamError::BadParameters(
                "target_packet_size must not exceed max_packet_size".into(),
            ));
        }
        if cfg.fifo_size == 0 || cfg.max_bitrate == 0 {
            return Err(StreamError::BadParameters("fifo_size and max_bitrate must be > 0".into()));
        }

        let ssrc: u32 = rand::random();
        let socket = transport::setup_sender_socket(&cfg, &logger)?;
        let fifo = Arc::new(NalFifo::new(cfg.fifo_size as usize));
        let monitor = Arc::new(MonitoringRing::new(DEFAULT_CAPACITY));
        let run_state = Arc::new(RunState {
            max_bitrate: AtomicU64::new(cfg.max_bitrate),
            max_latency_ms: AtomicU32::new(cfg.max_latency_ms),
            max_network_latency_ms: AtomicU32::new(cfg.max_network_latency_ms),
            running: AtomicBool::new(true),
        });
        // Mirrors ARSTREAMING_NETWORK_HEADERS_MAX_FRAME_SIZE: fragment size
        // times the configured cap on fragments per frame.
        let max_frame_size =
            (cfg.max_packet_size as usize).saturating_sub(2).max(1) * cfg.max_fragments_per_frame as usize;

        let thread_fifo = fifo.clone();
        let thread_monitor = monitor.clone();
        let thread_run_state = run_state.clone();
        let thread_logger = logger.for_component("Sender")?;
        let thread_nal_cb = nal_callback.clone();
        let thread_au_cb = au_callback.clone();
        let max_packet_size = cfg.max_packet_size as usize;
        let target_packet_size = cfg.target_packet_size as usize;

        let thread = std::thread::Builder::new()
            .name("nal-sender".into())
            .spawn(move || {
                packetizer_loop(
                    thread_fifo,
                    thread_monitor,
                    socket,
                    thread_run_state,
                    ssrc,
                    max_packet_size,
                    target_packet_size,
                    thread_logger,
                    thread_nal_cb,
                    thread_au_cb,
                )
            })
            .map_err(|e| StreamError::AllocFailed(format!("spawn sender thread: {}", e)))?;

        Ok(Sender {
            fifo,
            monitor,
            run_state,
            nal_callback,
            au_callback,
            max_frame_size,
            thread: Some(thread),
        })
    }

    /// Queues a single NAL unit for packetization (§4.2). `forced_discontinuity`
    /// carries the producer's discontinuity hint through to the descriptor;
    /// matching the upstream reference, the packetizer does not act on it.
    pub fn submit(
        &self,
        data: Arc<[u8]>,
        au_timestamp_us: u64,
        last_in_au: bool,
        forced_discontinuity: bool,
        nal_tag: T,
        au_tag: T,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(StreamError::BadParameters("empty NAL".into()));
        }
        if data.len() > self.max_frame_size {
            return Err(StreamError::FrameTooLarge);
        }
        if au_timestamp_us == 0 {
            return Err(StreamError::BadParameters("au_timestamp_us must be > 0".into()));
        }
        let mut desc = NalDescriptor::new(data, au_timestamp_us, clock::now_us(), last_in_au, nal_tag, au_tag);
        desc.forced_discontinuity = forced_discontinuity;
        self.fifo.enqueue(desc)
    }

    /// Queues every NAL of one access unit in order, marking the final
    /// entry as last-in-AU.
    pub fn submit_batch(&self, nals: Vec<(Arc<[u8]>, T)>, au_timestamp_us: u64, au_tag: T) -> Result<()> {
        let n = nals.len();
        for (i, (data, nal_tag)) in nals.into_iter().enumerate() {
            self.submit(data, au_timestamp_us, i == n - 1, false, nal_tag, au_tag.clone())?;
        }
        Ok(())
    }

    /// Synchronously cancels every NAL still queued (not yet handed to the
    /// packetizer thread), invoking its NAL/AU callbacks with `Cancelled`.
    pub fn flush(&self) {
        let nal_cb = self.nal_callback.clone();
        let au_cb = self.au_callback.clone();
        self.fifo.flush(
            |desc, status| {
                if let Some(cb) = &nal_cb {
                    cb(status, desc.nal_tag.clone());
                }
            },
            |desc, status| {
                if let Some(cb) = &au_cb {
                    cb(status, desc.au_tag.clone());
                }
            },
        );
    }

    pub fn monitoring(&self, start_time_us: u64, window_us: u64, with_stddev: bool) -> MonitoringStats {
        self.monitor.query(start_time_us, window_us, with_stddev)
    }

    /// Adjusts the bitrate/latency governor without restarting the stream.
    pub fn set_bitrate_and_latency(
        &self,
        max_bitrate: u64,
        max_latency_ms: u32,
        max_network_latency_ms: u32,
    ) -> Result<()> {
        if max_bitrate == 0 {
            return Err(StreamError::BadParameters("max_bitrate must be > 0".into()));
        }
        self.run_state.max_bitrate.store(max_bitrate, Ordering::Relaxed);
        self.run_state.max_latency_ms.store(max_latency_ms, Ordering::Relaxed);
        self.run_state
            .max_network_latency_ms
            .store(max_network_latency_ms, Ordering::Relaxed);
        Ok(())
    }

    /// Signals the packetizer thread to drain its backlog and exit, then
    /// joins it. Already-queued NALs are still packetized and sent (call
    /// `flush` first to cancel them instead).
    pub fn stop(&mut self) -> Result<()> {
        self.fifo.shutdown();
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| StreamError::Transport("sender thread panicked".into()))?;
        }
        Ok(())
    }

    /// Non-blocking variant of `stop`: signals shutdown but returns
    /// `Busy` instead of joining if the packetizer thread hasn't finished
    /// draining its backlog yet. Calling it again later retries the join.
    pub fn close(&mut self) -> Result<()> {
        self.fifo.shutdown();
        if self.run_state.running.load(Ordering::Acquire) {
            return Err(StreamError::Busy);
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| StreamError::Transport("sender thread panicked".into()))?;
        }
        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.fifo.shutdown();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn compute_timestamp_90k(first_au_ts: &mut Option<u64>, au_timestamp_us: u64) -> u32 {
    let base = *first_au_ts.get_or_insert(au_timestamp_us);
    (((au_timestamp_us.saturating_sub(base)) * 90 + 500) / 1000) as u32
}

/// Total-latency / network-latency drop predicates (§4.3), net of the time
/// a packet is expected to spend draining through the socket/FIFO buffer.
fn should_drop<T>(desc: &NalDescriptor<T>, wall_us: u64, run_state: &RunState) -> bool {
    if desc.force_drop {
        return true;
    }
    let max_bitrate = run_state.max_bitrate.load(Ordering::Relaxed).max(1);
    let max_latency_ms = run_state.max_latency_ms.load(Ordering::Relaxed);
    let max_network_latency_ms = run_state.max_network_latency_ms.load(Ordering::Relaxed);

    let buffer_bytes = transport::socket_buffer_target_bytes(max_bitrate, max_network_latency_ms);
    let drain_us = (buffer_bytes as u128 * 8 * 1_000_000 / max_bitrate as u128) as i64;

    if max_latency_ms != 0 {
        let max_latency_us = max_latency_ms as i64 * 1000 - drain_us;
        if wall_us as i64 - desc.au_timestamp_us as i64 > max_latency_us {
            return true;
        }
    }
    let max_network_latency_us = max_network_latency_ms as i64 * 1000 - drain_us;
    wall_us as i64 - desc.submit_time_us as i64 > max_network_latency_us
}

/// Sheds queued-but-undequeued NALs, lowest NRI and newest-first within a
/// tier, until the FIFO's backlog fits the socket buffer target (§4.3).
fn run_bitrate_governor<T>(fifo: &NalFifo<T>, run_state: &RunState, logger: &Logger) {
    let max_bitrate = run_state.max_bitrate.load(Ordering::Relaxed);
    let max_network_latency_ms = run_state.max_network_latency_ms.load(Ordering::Relaxed);
    let target = transport::socket_buffer_target_bytes(max_bitrate, max_network_latency_ms);

    let mut total = fifo.total_bytes();
    if total <= target {
        return;
    }

    let by_nri = fifo.snapshot_sizes_by_nri();
    let mut to_drop = Vec::new();
    'outer: for tier in &by_nri {
        for &(idx, size) in tier.iter().rev() {
            if total <= target {
                break 'outer;
            }
            to_drop.push(idx);
            total = total.saturating_sub(size);
        }
    }

    if !to_drop.is_empty() {
        logger.warn(&format!("bitrate governor dropping {} queued NAL(s)", to_drop.len()));
        fifo.mark_drop(&to_drop);
    }
}

#[allow(clippy::too_many_arguments)]
fn send_wire_packet<T>(
    header: &mut PacketHeader,
    socket: &SenderSocket,
    fifo: &NalFifo<T>,
    monitor: &MonitoringRing,
    run_state: &RunState,
    logger: &Logger,
    payload: Vec<u8>,
    marker: bool,
    timestamp_90k: u32,
    au_timestamp_us: u64,
    submit_time_us: u64,
) -> bool {
    let sequence_number = header.sequence_number;
    header.sequence_number = header.sequence_number.wrapping_add(1);

    let mut hdr = *header;
    hdr.sequence_number = sequence_number;
    hdr.marker = marker;
    hdr.timestamp = timestamp_90k;

    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.extend_from_slice(&hdr.to_bytes());
    packet.extend_from_slice(&payload);

    let wall = clock::now_us();
    let mut sent = socket.send(&packet).is_ok();
    if !sent {
        run_bitrate_governor(fifo, run_state, logger);
        let max_network_latency_us = run_state.max_network_latency_ms.load(Ordering::Relaxed) as i64 * 1000;
        let elapsed_us = clock::now_us() as i64 - submit_time_us as i64;
        let backoff_us = (max_network_latency_us - elapsed_us).clamp(0, 5_000) as u64;
        fifo.wait_timeout(Duration::from_micros(backoff_us));
        sent = socket.send(&packet).is_ok();
        if !sent {
            logger.warn("dropping packet after socket remained unwritable");
        }
    }

    monitor.record(MonitorEvent {
        wall_time_us: wall,
        au_timestamp_us,
        sequence_number,
        marker,
        bytes: if sent { packet.len() as u32 } else { 0 },
        bytes_dropped: if sent { 0 } else { packet.len() as u32 },
        network_transit_us: None,
        acquisition_to_network_us: Some(wall as i64 - submit_time_us as i64),
        jitter_us: None,
        packets_missed: 0,
    });

    sent
}

/// Sends one aggregate's STAP-A packet and fans its wire-send outcome out
/// to every member NAL's callback (§8 Invariant 3: one of them, not one
/// per packet). Returns whether the send succeeded.
#[allow(clippy::too_many_arguments)]
fn flush_aggregate<T: Clone>(
    agg: AggState<T>,
    marker: bool,
    header: &mut PacketHeader,
    socket: &SenderSocket,
    fifo: &NalFifo<T>,
    monitor: &MonitoringRing,
    run_state: &RunState,
    logger: &Logger,
    first_au_ts: &mut Option<u64>,
    nal_callback: &Option<NalCallback<T>>,
) -> bool {
    let nalus: Vec<&[u8]> = agg.nalus.iter().map(|n| &n[..]).collect();
    let payload = wire::build_stap_a(&nalus);
    let timestamp_90k = compute_timestamp_90k(first_au_ts, agg.au_timestamp_us);
    let sent = send_wire_packet(
        header,
        socket,
        fifo,
        monitor,
        run_state,
        logger,
        payload,
        marker,
        timestamp_90k,
        agg.au_timestamp_us,
        agg.submit_time_us,
    );

    if let Some(cb) = nal_callback {
        let status = if sent { CallbackStatus::Sent } else { CallbackStatus::Cancelled };
        for tag in &agg.nal_tags {
            cb(status, tag.clone());
        }
    }
    sent
}

#[allow(clippy::too_many_arguments)]
fn emit_single<T>(
    desc: &NalDescriptor<T>,
    header: &mut PacketHeader,
    socket: &SenderSocket,
    fifo: &NalFifo<T>,
    monitor: &MonitoringRing,
    run_state: &RunState,
    logger: &Logger,
    first_au_ts: &mut Option<u64>,
) -> bool {
    let timestamp_90k = compute_timestamp_90k(first_au_ts, desc.au_timestamp_us);
    send_wire_packet(
        header,
        socket,
        fifo,
        monitor,
        run_state,
        logger,
        desc.data.to_vec(),
        desc.last_in_au,
        timestamp_90k,
        desc.au_timestamp_us,
        desc.submit_time_us,
    )
}

/// Fragments one NAL across FU-A packets (§4.3): the fragment count
/// targets `targetPacketSize`-sized pieces, but is widened if needed so no
/// fragment exceeds `maxPacketSize - 2` payload bytes.
#[allow(clippy::too_many_arguments)]
fn emit_fu_a<T>(
    desc: &NalDescriptor<T>,
    target_packet_size: usize,
    max_packet_size: usize,
    header: &mut PacketHeader,
    socket: &SenderSocket,
    fifo: &NalFifo<T>,
    monitor: &MonitoringRing,
    run_state: &RunState,
    logger: &Logger,
    first_au_ts: &mut Option<u64>,
) -> bool {
    let (nri, nal_type) = wire::parse_nal_header(desc.data[0]);
    let rbsp = &desc.data[1..];
    let len = rbsp.len().max(1);

    let max_fragment_payload = max_packet_size.saturating_sub(2).max(1);
    let fragment_count = len
        .div_ceil(target_packet_size)
        .max(len.div_ceil(max_fragment_payload))
        .max(1);
    let mean_fragment_size = ((len + fragment_count / 2) / fragment_count)
        .min(max_fragment_payload)
        .max(1);

    let timestamp_90k = compute_timestamp_90k(first_au_ts, desc.au_timestamp_us);
    let chunks: Vec<&[u8]> = rbsp.chunks(mean_fragment_size).collect();
    let last = chunks.len().saturating_sub(1);

    let mut all_sent = true;
    for (i, chunk) in chunks.iter().enumerate() {
        let is_start = i == 0;
        let is_end = i == last;
        let prefix = wire::build_fu_a_prefix(nri, nal_type, is_start, is_end);
        let mut payload = Vec::with_capacity(2 + chunk.len());
        payload.extend_from_slice(&prefix);
        payload.extend_from_slice(chunk);

        let sent = send_wire_packet(
            header,
            socket,
            fifo,
            monitor,
            run_state,
            logger,
            payload,
            is_end && desc.last_in_au,
            timestamp_90k,
            desc.au_timestamp_us,
            desc.submit_time_us,
        );
        all_sent &= sent;
    }
    all_sent
}

fn handle_drop<T: Clone>(
    desc: &NalDescriptor<T>,
    header: &mut PacketHeader,
    monitor: &MonitoringRing,
    nal_callback: &Option<NalCallback<T>>,
    au_callback: &Option<AuCallback<T>>,
    last_au_callback_ts: &mut Option<u64>,
) {
    let sequence_number = header.sequence_number;
    header.sequence_number = header.sequence_number.wrapping_add(1);

    let wall = clock::now_us();
    monitor.record(MonitorEvent {
        wall_time_us: wall,
        au_timestamp_us: desc.au_timestamp_us,
        sequence_number,
        marker: false,
        bytes: 0,
        bytes_dropped: desc.len() as u32,
        network_transit_us: None,
        acquisition_to_network_us: Some(wall as i64 - desc.submit_time_us as i64),
        jitter_us: None,
        packets_missed: 0,
    });

    if let Some(cb) = nal_callback {
        cb(CallbackStatus::Cancelled, desc.nal_tag.clone());
    }
    if desc.last_in_au && *last_au_callback_ts != Some(desc.au_timestamp_us) {
        if let Some(cb) = au_callback {
            cb(CallbackStatus::Cancelled, desc.au_tag.clone());
        }
        *last_au_callback_ts = Some(desc.au_timestamp_us);
    }
}

#[allow(clippy::too_many_arguments)]
fn packetizer_loop<T: Clone>(
    fifo: Arc<NalFifo<T>>,
    monitor: Arc<MonitoringRing>,
    socket: SenderSocket,
    run_state: Arc<RunState>,
    ssrc: u32,
    max_packet_size: usize,
    target_packet_size: usize,
    logger: Logger,
    nal_callback: Option<NalCallback<T>>,
    au_callback: Option<AuCallback<T>>,
) {
    let mut header = PacketHeader::new(ssrc);
    let mut first_au_ts: Option<u64> = None;
    let mut last_au_callback_ts: Option<u64> = None;
    let mut prev_desc: Option<NalDescriptor<T>> = None;
    let mut agg: Option<AggState<T>> = None;

    while let Some(desc) = fifo.dequeue_blocking() {
        // Safety net: if the previous descriptor's AU was never closed by
        // its own last-in-AU flag and this descriptor belongs to a new AU,
        // close it out now.
        if let Some(prev) = prev_desc.take() {
            if last_au_callback_ts != Some(prev.au_timestamp_us) && prev.au_timestamp_us != desc.au_timestamp_us {
                if let Some(cb) = &au_callback {
                    cb(CallbackStatus::Sent, prev.au_tag.clone());
                }
                last_au_callback_ts = Some(prev.au_timestamp_us);
            }
        }

        if let Some(pending) = &agg {
            if pending.au_timestamp_us != desc.au_timestamp_us {
                let pending = agg.take().unwrap();
                flush_aggregate(
                    pending,
                    false,
                    &mut header,
                    &socket,
                    &fifo,
                    &monitor,
                    &run_state,
                    &logger,
                    &mut first_au_ts,
                    &nal_callback,
                );
            }
        }

        let wall = clock::now_us();
        if should_drop(&desc, wall, &run_state) {
            handle_drop(&desc, &mut header, &monitor, &nal_callback, &au_callback, &mut last_au_callback_ts);
            prev_desc = Some(desc);
            continue;
        }

        let total_len = desc.len();
        let needs_fragmentation =
            total_len > max_packet_size || total_len.div_ceil(target_packet_size) > 1;

        // `Some(sent)` once this NAL's own wire-send outcome is known in
        // this iteration; stays `None` when the NAL joined a pending
        // aggregate whose outcome (and callback firing) is deferred to a
        // later `flush_aggregate` call.
        let mut sent_now: Option<bool> = None;

        if needs_fragmentation {
            if let Some(pending) = agg.take() {
                flush_aggregate(
                    pending,
                    false,
                    &mut header,
                    &socket,
                    &fifo,
                    &monitor,
                    &run_state,
                    &logger,
                    &mut first_au_ts,
                    &nal_callback,
                );
            }
            sent_now = Some(emit_fu_a(
                &desc,
                target_packet_size,
                max_packet_size,
                &mut header,
                &socket,
                &fifo,
                &monitor,
                &run_state,
                &logger,
                &mut first_au_ts,
            ));
        } else {
            match &mut agg {
                Some(state) => {
                    let added = 2 + total_len;
                    if state.size + added <= max_packet_size && state.size + added <= target_packet_size {
                        state.nalus.push(desc.data.clone());
                        state.nal_tags.push(desc.nal_tag.clone());
                        state.size += added;
                        if desc.last_in_au {
                            let finished = agg.take().unwrap();
                            // flush_aggregate fires every member's NAL
                            // callback (desc's included, already pushed
                            // above); only the AU callback is still ours
                            // to fire here.
                            let sent = flush_aggregate(
                                finished,
                                true,
                                &mut header,
                                &socket,
                                &fifo,
                                &monitor,
                                &run_state,
                                &logger,
                                &mut first_au_ts,
                                &nal_callback,
                            );
                            if last_au_callback_ts != Some(desc.au_timestamp_us) {
                                let status = if sent { CallbackStatus::Sent } else { CallbackStatus::Cancelled };
                                if let Some(cb) = &au_callback {
                                    cb(status, desc.au_tag.clone());
                                }
                                last_au_callback_ts = Some(desc.au_timestamp_us);
                            }
                        }
                    } else {
                        let finished = agg.take().unwrap();
                        flush_aggregate(
                            finished,
                            false,
                            &mut header,
                            &socket,
                            &fifo,
                            &monitor,
                            &run_state,
                            &logger,
                            &mut first_au_ts,
                            &nal_callback,
                        );
                        if desc.last_in_au {
                            sent_now = Some(emit_single(
                                &desc, &mut header, &socket, &fifo, &monitor, &run_state, &logger,
                                &mut first_au_ts,
                            ));
                        } else {
                            agg = Some(AggState {
                                nalus: vec![desc.data.clone()],
                                nal_tags: vec![desc.nal_tag.clone()],
                                au_timestamp_us: desc.au_timestamp_us,
                                submit_time_us: desc.submit_time_us,
                                au_tag: desc.au_tag.clone(),
                                size: 1 + 2 + total_len,
                            });
                        }
                    }
                }
                None => {
                    let standalone_size = 1 + 2 + total_len;
                    if desc.last_in_au
                        || standalone_size > max_packet_size
                        || standalone_size > target_packet_size
                    {
                        sent_now = Some(emit_single(
                            &desc, &mut header, &socket, &fifo, &monitor, &run_state, &logger,
                            &mut first_au_ts,
                        ));
                    } else {
                        agg = Some(AggState {
                            nalus: vec![desc.data.clone()],
                            nal_tags: vec![desc.nal_tag.clone()],
                            au_timestamp_us: desc.au_timestamp_us,
                            submit_time_us: desc.submit_time_us,
                            au_tag: desc.au_tag.clone(),
                            size: standalone_size,
                        });
                    }
                }
            }
        }

        if let Some(sent) = sent_now {
            let status = if sent { CallbackStatus::Sent } else { CallbackStatus::Cancelled };
            if let Some(cb) = &nal_callback {
                cb(status, desc.nal_tag.clone());
            }
            if desc.last_in_au && last_au_callback_ts != Some(desc.au_timestamp_us) {
                if let Some(cb) = &au_callback {
                    cb(status, desc.au_tag.clone());
                }
                last_au_callback_ts = Some(desc.au_timestamp_us);
            }
        }

        prev_desc = Some(desc);
    }

    if let Some(pending) = agg.take() {
        flush_aggregate(
            pending,
            true,
            &mut header,
            &socket,
            &fifo,
            &monitor,
            &run_state,
            &logger,
            &mut first_au_ts,
            &nal_callback,
        );
    }

    run_state.running.store(false, Ordering::Release);
}
