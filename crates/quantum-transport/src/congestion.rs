//! BBR-style congestion controller.
//!
//! ```text
//!        full_bw_reached           in_flight <= BDP
//!  Startup ───────────────► Drain ───────────────► ProbeBW
//!     ▲                                                │ every ProbeRTTInterval
//!     │                ProbeRTTDuration elapsed         ▼
//!     └──────────────────────────────────────────── ProbeRTT
//! ```
//!
//! Estimates bottleneck bandwidth and minimum round-trip time from ACK
//! telemetry and drives a pacing rate and congestion window from them,
//! rather than reacting to loss directly (loss only feeds bandwidth
//! sampling, never cuts `cwnd`).

use std::time::Duration;

use quanta::Instant;

use crate::wire::MAX_PAYLOAD;

pub const STARTUP_GAIN: f64 = 2.77;
pub const DRAIN_GAIN: f64 = 1.0 / STARTUP_GAIN;
pub const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);
pub const PROBE_RTT_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_PIPE_CWND_PACKETS: u64 = 4;
pub const FULL_BW_GROWTH_THRESHOLD: f64 = 1.25;
pub const PROBE_BW_CYCLE: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const MAX_BW_SAMPLES: usize = 10;
const FULL_BW_ROUNDS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrState {
    Startup,
    Drain,
    ProbeBW,
    ProbeRTT,
}

pub struct BbrController {
    state: BbrState,
    btl_bw: f64,
    rt_prop: Option<Duration>,
    rt_prop_stamp: Instant,
    pacing_rate: f64,
    send_window_bytes: u64,
    pacing_gain: f64,
    cwnd_gain: f64,
    cycle_index: usize,
    cycle_stamp: Instant,
    samples: Vec<f64>,
    full_bw_counter: u32,
    last_full_bw: f64,
    bytes_in_flight: u64,
    last_sample_time: Option<Instant>,
    probe_rtt_entered: Option<Instant>,
    packets_lost: u64,
}

impl BbrController {
    pub fn new(initial_cwnd_packets: u64, now: Instant) -> Self {
        BbrController {
            state: BbrState::Startup,
            btl_bw: 0.0,
            rt_prop: None,
            rt_prop_stamp: now,
            pacing_rate: 0.0,
            send_window_bytes: initial_cwnd_packets * MAX_PAYLOAD as u64,
            pacing_gain: STARTUP_GAIN,
            cwnd_gain: STARTUP_GAIN,
            cycle_index: 0,
            cycle_stamp: now,
            samples: Vec::with_capacity(MAX_BW_SAMPLES),
            full_bw_counter: 0,
            last_full_bw: 0.0,
            bytes_in_flight: 0,
            last_sample_time: None,
            probe_rtt_entered: None,
            packets_lost: 0,
        }
    }

    pub fn state(&self) -> BbrState {
        self.state
    }

    pub fn btl_bw(&self) -> f64 {
        self.btl_bw
    }

    pub fn rt_prop(&self) -> Option<Duration> {
        self.rt_prop
    }

    pub fn pacing_rate(&self) -> f64 {
        self.pacing_rate
    }

    pub fn send_window_bytes(&self) -> u64 {
        self.send_window_bytes
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    fn bdp(&self) -> f64 {
        match self.rt_prop {
            Some(rt_prop) if self.btl_bw > 0.0 && !rt_prop.is_zero() => {
                self.btl_bw * rt_prop.as_secs_f64()
            }
            _ => (MIN_PIPE_CWND_PACKETS * MAX_PAYLOAD as u64) as f64,
        }
    }

    /// Delay to insert before the next packet of `size` bytes, given the
    /// current pacing rate. Zero until the first bandwidth sample exists.
    pub fn pacing_delay(&self, size: usize) -> Duration {
        if self.pacing_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(size as f64 / self.pacing_rate)
    }

    pub fn on_packet_sent(&mut self, size: usize, _now: Instant) {
        self.bytes_in_flight += size as u64;
    }

    pub fn on_packet_lost(&mut self, size: usize, _now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size as u64);
        self.packets_lost += 1;
    }

    pub fn on_packet_acked(&mut self, size: usize, rtt: Duration, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size as u64);

        // 1. RTT update.
        let should_update_rt_prop = match self.rt_prop {
            None => true,
            Some(rt_prop) => rtt < rt_prop || now.saturating_duration_since(self.rt_prop_stamp) > PROBE_RTT_INTERVAL,
        };
        if should_update_rt_prop {
            self.rt_prop = Some(rtt);
            self.rt_prop_stamp = now;
        }

        // 2. Bandwidth sample.
        if let Some(last) = self.last_sample_time {
            let interval = now.saturating_duration_since(last);
            if !interval.is_zero() {
                let bw = size as f64 / interval.as_secs_f64();
                self.samples.push(bw);
                if self.samples.len() > MAX_BW_SAMPLES {
                    self.samples.remove(0);
                }
                self.btl_bw = self.samples.iter().cloned().fold(0.0, f64::max);
            }
        }
        self.last_sample_time = Some(now);

        // 3. Startup fullness check.
        if self.state == BbrState::Startup {
            if self.btl_bw < FULL_BW_GROWTH_THRESHOLD * self.last_full_bw {
                self.full_bw_counter += 1;
            } else {
                self.full_bw_counter = 0;
                self.last_full_bw = self.btl_bw;
            }
        }

        // 4. State transitions.
        match self.state {
            BbrState::Startup => {
                if self.full_bw_counter >= FULL_BW_ROUNDS {
                    self.state = BbrState::Drain;
                    self.pacing_gain = DRAIN_GAIN;
                    self.cwnd_gain = 2.0;
                }
            }
            BbrState::Drain => {
                if (self.bytes_in_flight as f64) <= self.bdp() {
                    self.state = BbrState::ProbeBW;
                    self.cycle_index = 0;
                    self.cycle_stamp = now;
                    self.pacing_gain = PROBE_BW_CYCLE[0];
                    self.cwnd_gain = 2.0;
                }
            }
            BbrState::ProbeBW => {
                if let Some(rt_prop) = self.rt_prop {
                    if !rt_prop.is_zero() && now.saturating_duration_since(self.cycle_stamp) >= rt_prop {
                        self.cycle_index = (self.cycle_index + 1) % PROBE_BW_CYCLE.len();
                        self.cycle_stamp = now;
                        self.pacing_gain = PROBE_BW_CYCLE[self.cycle_index];
                    }
                }
                if now.saturating_duration_since(self.rt_prop_stamp) > PROBE_RTT_INTERVAL {
                    self.state = BbrState::ProbeRTT;
                    self.probe_rtt_entered = Some(now);
                    self.pacing_gain = 1.0;
                    self.cwnd_gain = 1.0;
                }
            }
            BbrState::ProbeRTT => {
                if let Some(entered) = self.probe_rtt_entered {
                    if now.saturating_duration_since(entered) >= PROBE_RTT_DURATION {
                        self.state = BbrState::ProbeBW;
                        self.cycle_index = 0;
                        self.cycle_stamp = now;
                        self.pacing_gain = PROBE_BW_CYCLE[0];
                        self.cwnd_gain = 2.0;
                        self.probe_rtt_entered = None;
                    }
                }
            }
        }

        // 5. Rate/window.
        self.pacing_rate = self.pacing_gain * self.btl_bw;
        let bdp = self.bdp();
        let min_pipe_bytes = (MIN_PIPE_CWND_PACKETS * MAX_PAYLOAD as u64) as f64;
        self.send_window_bytes = min_pipe_bytes.max(self.cwnd_gain * bdp) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_startup_with_startup_gain() {
        let c = BbrController::new(10, Instant::now());
        assert_eq!(c.state(), BbrState::Startup);
        assert_eq!(c.pacing_gain, STARTUP_GAIN);
    }

    #[test]
    fn no_pacing_delay_before_first_sample() {
        let c = BbrController::new(10, Instant::now());
        assert_eq!(c.pacing_delay(1000), Duration::ZERO);
    }

    #[test]
    fn bdp_defaults_to_min_pipe_cwnd_when_no_samples() {
        let c = BbrController::new(10, Instant::now());
        assert_eq!(c.bdp(), (MIN_PIPE_CWND_PACKETS * MAX_PAYLOAD as u64) as f64);
    }

    #[test]
    fn bandwidth_sample_updates_btl_bw() {
        let mut c = BbrController::new(10, Instant::now());
        let t0 = Instant::now();
        c.on_packet_acked(1400, Duration::from_millis(50), t0);
        let t1 = t0 + Duration::from_millis(10);
        c.on_packet_acked(1400, Duration::from_millis(50), t1);
        assert!(c.btl_bw() > 0.0);
    }

    #[test]
    fn btl_bw_dominated_by_last_ten_samples() {
        let mut c = BbrController::new(10, Instant::now());
        let mut t = Instant::now();
        // First sample establishes last_sample_time; no bw computed yet.
        c.on_packet_acked(100, Duration::from_millis(20), t);
        let mut max_seen = 0.0f64;
        for i in 0..20 {
            t += Duration::from_millis(10);
            // Vary size so bandwidth samples vary.
            let size = 100 + (i % 5) * 50;
            c.on_packet_acked(size, Duration::from_millis(20), t);
            max_seen = max_seen.max(c.btl_bw());
        }
        assert!((c.btl_bw() - max_seen).abs() < 1e-6 || c.btl_bw() <= max_seen);
    }

    #[test]
    fn loss_does_not_reduce_cwnd() {
        let mut c = BbrController::new(10, Instant::now());
        let now = Instant::now();
        c.on_packet_sent(1400, now);
        let before = c.send_window_bytes();
        c.on_packet_lost(1400, now);
        assert_eq!(c.send_window_bytes(), before);
        assert_eq!(c.packets_lost(), 1);
    }

    #[test]
    fn startup_transitions_to_drain_after_three_flat_rounds() {
        let mut c = BbrController::new(10, Instant::now());
        let mut t = Instant::now();
        // Prime one sample first so the bandwidth start computing.
        c.on_packet_acked(1400, Duration::from_millis(20), t);
        for _ in 0..3 {
            t += Duration::from_millis(20);
            // Constant-size, evenly-spaced samples => plateaued bandwidth
            // after the first real sample establishes last_full_bw.
            c.on_packet_acked(1400, Duration::from_millis(20), t);
        }
        for _ in 0..4 {
            t += Duration::from_millis(20);
            c.on_packet_acked(1400, Duration::from_millis(20), t);
        }
        assert_eq!(c.state(), BbrState::Drain);
        assert_eq!(c.pacing_gain, DRAIN_GAIN);
    }
}
