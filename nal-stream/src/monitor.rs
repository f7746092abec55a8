//! Monitoring ring (§4.6): a fixed-capacity circular log of per-packet
//! events with windowed backward-walk aggregation. Shared by senders,
//! receivers, and resenders — whichever side records an event decides
//! which of its optional fields apply.

use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 2048;

/// One packet event (§3, "Monitoring point").
#[derive(Debug, Clone, Copy)]
pub struct MonitorEvent {
    pub wall_time_us: u64,
    pub au_timestamp_us: u64,
    pub sequence_number: u16,
    pub marker: bool,
    /// Packet byte count; zero encodes a drop event (`bytes_dropped` then
    /// carries the size that was dropped).
    pub bytes: u32,
    pub bytes_dropped: u32,
    /// Receiver-side: wall-clock minus AU timestamp for this arrival.
    pub network_transit_us: Option<i64>,
    /// Sender-side: time this descriptor spent queued before hitting the wire.
    pub acquisition_to_network_us: Option<i64>,
    /// Receiver-side RFC-3550-style interarrival jitter sample.
    pub jitter_us: Option<f64>,
    /// Receiver-side: sequence numbers skipped arriving at this packet
    /// (0 on every packet that isn't the first to follow a gap).
    pub packets_missed: u32,
}

impl MonitorEvent {
    pub fn is_drop(&self) -> bool {
        self.bytes == 0 && self.bytes_dropped > 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonitoringStats {
    pub covered_us: u64,
    pub mean_packet_size: f64,
    pub mean_network_transit_us: f64,
    pub mean_acquisition_to_network_us: f64,
    pub bytes_sent: u64,
    pub bytes_dropped: u64,
    pub packets_sent: u64,
    pub nalus_dropped: u64,
    pub packets_missed: u64,
    pub stddev_packet_size: Option<f64>,
    pub stddev_jitter_us: Option<f64>,
}

struct RingState {
    slots: Vec<Option<MonitorEvent>>,
    write_index: usize,
    count: usize,
}

pub struct MonitoringRing {
    capacity: usize,
    state: Mutex<RingState>,
}

impl MonitoringRing {
    pub fn new(capacity: usize) -> Self {
        MonitoringRing {
            capacity,
            state: Mutex::new(RingState {
                slots: vec![None; capacity],
                write_index: 0,
                count: 0,
            }),
        }
    }

    pub fn record(&self, event: MonitorEvent) {
        let mut state = self.state.lock().unwrap();
        let idx = state.write_index;
        state.slots[idx] = Some(event);
        state.write_index = (idx + 1) % self.capacity;
        state.count = (state.count + 1).min(self.capacity);
    }

    /// Walks backward from the most recent event whose `wall_time_us` is
    /// `<= start_time_us` (or from the newest if `start_time_us == 0`)
    /// until either the ring is exhausted or an event predates
    /// `start_time_us - window_us`. `with_stddev` controls the optional
    /// second pass for population standard deviations.
    pub fn query(&self, start_time_us: u64, window_us: u64, with_stddev: bool) -> MonitoringStats {
        let state = self.state.lock().unwrap();
        if state.count == 0 {
            return MonitoringStats::default();
        }

        let newest_idx = (state.write_index + self.capacity - 1) % self.capacity;
        let effective_start = if start_time_us == 0 {
            state.slots[newest_idx].unwrap().wall_time_us
        } else {
            start_time_us
        };
        let floor = effective_start.saturating_sub(window_us);

        let mut events = Vec::new();
        let mut idx = newest_idx;
        for _ in 0..state.count {
            let event = match state.slots[idx] {
                Some(e) => e,
                None => break,
            };
            if event.wall_time_us > effective_start {
                idx = (idx + self.capacity - 1) % self.capacity;
                continue;
            }
            if event.wall_time_us < floor {
                break;
            }
            events.push(event);
            idx = (idx + self.capacity - 1) % self.capacity;
        }
        drop(state);

        if events.is_empty() {
            return MonitoringStats::default();
        }

        let oldest = events.last().unwrap().wall_time_us;
        let newest = events.first().unwrap().wall_time_us;
        let covered_us = newest.saturating_sub(oldest);

        let mut size_sum = 0f64;
        let mut size_n = 0u64;
        let mut transit_sum = 0f64;
        let mut transit_n = 0u64;
        let mut acq_sum = 0f64;
        let mut acq_n = 0u64;
        let mut bytes_sent = 0u64;
        let mut bytes_dropped = 0u64;
        let mut packets_sent = 0u64;
        let mut nalus_dropped = 0u64;
        let mut packets_missed = 0u64;

        for e in &events {
            if e.bytes > 0 {
                size_sum += e.bytes as f64;
                size_n += 1;
                bytes_sent += e.bytes as u64;
                packets_sent += 1;
            } else {
                bytes_dropped += e.bytes_dropped as u64;
                nalus_dropped += 1;
            }
            packets_missed += e.packets_missed as u64;
            if let Some(t) = e.network_transit_us {
                transit_sum += t as f64;
                transit_n += 1;
            }
            if let Some(a) = e.acquisition_to_network_us {
                acq_sum += a as f64;
                acq_n += 1;
            }
        }

        let mean_packet_size = if size_n > 0 { size_sum / size_n as f64 } else { 0.0 };
        let mean_network_transit_us = if transit_n > 0 { transit_sum / transit_n as f64 } else { 0.0 };
        let mean_acquisition_to_network_us = if acq_n > 0 { acq_sum / acq_n as f64 } else { 0.0 };

        let (stddev_packet_size, stddev_jitter_us) = if with_stddev {
            let pop_stddev = |values: &[f64], mean: f64| -> Option<f64> {
                if values.is_empty() {
                    return None;
                }
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
                Some(variance.sqrt())
            };

            let sizes: Vec<f64> = events.iter().filter(|e| e.bytes > 0).map(|e| e.bytes as f64).collect();
            let jitters: Vec<f64> = events.iter().filter_map(|e| e.jitter_us).collect();
            let jitter_mean = if jitters.is_empty() {
                0.0
            } else {
                jitters.iter().sum::<f64>() / jitters.len() as f64
            };

            (
                pop_stddev(&sizes, mean_packet_size),
                pop_stddev(&jitters, jitter_mean),
            )
        } else {
            (None, None)
        };

        MonitoringStats {
            covered_us,
            mean_packet_size,
            mean_network_transit_us,
            mean_acquisition_to_network_us,
            bytes_sent,
            bytes_dropped,
            packets_sent,
            nalus_dropped,
            packets_missed,
            stddev_packet_size,
            stddev_jitter_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent_event(wall: u64, bytes: u32) -> MonitorEvent {
        MonitorEvent {
            wall_time_us: wall,
            au_timestamp_us: wall,
            sequence_number: 0,
            marker: false,
            bytes,
            bytes_dropped: 0,
            network_transit_us: None,
            acquisition_to_network_us: Some(100),
            jitter_us: None,
            packets_missed: 0,
        }
    }

    fn drop_event(wall: u64, dropped: u32) -> MonitorEvent {
        MonitorEvent {
            wall_time_us: wall,
            au_timestamp_us: wall,
            sequence_number: 0,
            marker: false,
            bytes: 0,
            bytes_dropped: dropped,
            network_transit_us: None,
            acquisition_to_network_us: None,
            jitter_us: None,
            packets_missed: 0,
        }
    }

    #[test]
    fn query_aggregates_sent_and_dropped() {
        let ring = MonitoringRing::new(16);
        ring.record(sent_event(1000, 500));
        ring.record(sent_event(2000, 700));
        ring.record(drop_event(3000, 300));

        let stats = ring.query(0, 10_000, false);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.nalus_dropped, 1);
        assert_eq!(stats.bytes_sent, 1200);
        assert_eq!(stats.bytes_dropped, 300);
        assert!((stats.mean_packet_size - 600.0).abs() < 1e-9);
    }

    #[test]
    fn query_window_excludes_older_events() {
        let ring = MonitoringRing::new(16);
        ring.record(sent_event(1000, 500));
        ring.record(sent_event(50_000, 700));

        let stats = ring.query(50_000, 1_000, false);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 700);
    }

    #[test]
    fn ring_overwrites_in_fifo_order() {
        let ring = MonitoringRing::new(2);
        ring.record(sent_event(1, 10));
        ring.record(sent_event(2, 20));
        ring.record(sent_event(3, 30));

        let stats = ring.query(0, 100, false);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 50); // events at t=2 and t=3 only
    }

    #[test]
    fn stddev_is_none_without_request() {
        let ring = MonitoringRing::new(16);
        ring.record(sent_event(1, 100));
        let stats = ring.query(0, 100, false);
        assert!(stats.stddev_packet_size.is_none());
    }

    #[test]
    fn stddev_computed_when_requested() {
        let ring = MonitoringRing::new(16);
        ring.record(sent_event(1, 100));
        ring.record(sent_event(2, 300));
        let stats = ring.query(0, 100, true);
        assert!(stats.stddev_packet_size.unwrap() > 0.0);
    }

    #[test]
    fn query_sums_packets_missed_across_events() {
        let ring = MonitoringRing::new(16);
        let mut first = sent_event(1000, 500);
        first.packets_missed = 2;
        let mut second = sent_event(2000, 500);
        second.packets_missed = 1;
        ring.record(first);
        ring.record(second);

        let stats = ring.query(0, 10_000, false);
        assert_eq!(stats.packets_missed, 3);
    }

    #[test]
    fn empty_ring_returns_default_stats() {
        let ring = MonitoringRing::new(16);
        let stats = ring.query(0, 100, false);
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.covered_us, 0);
    }
}
