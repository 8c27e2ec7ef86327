//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

// Number of received packets over which the packet-loss percentage is
// recomputed. Grounded in `original_source/bfd.c`'s
// `ptm_bfd_send_sla_update`, which doesn't surface this as a runtime
// knob; 100 matches common reference-implementation practice.
pub const PKTS_TO_CONSIDER_FOR_PKT_LOSS: u32 = 100;

// Rolling SLA accumulators for a single session. Only touched when the
// session's `track_sla` flag is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlaStats {
    // Sum of per-packet latencies (ms) accumulated since the last emit.
    latency_acc: u32,
    // Sum of |Δlatency| (ms) accumulated since the last emit.
    jitter_acc: u32,
    // Latency (ms) observed for the previous packet, 0 if none yet.
    old_latency: u32,
    // Packet-loss count as of the last time it was recomputed.
    pkts_lost: u32,
    // Last emitted moving averages, retained for reporting between emits.
    pub latency: u32,
    pub jitter: u32,
    pub pkt_loss_pct: f32,
}

// One completed round-trip observation fed into the meter.
pub struct SlaSample {
    pub latency_ms: u32,
    pub total_rx_pkts: u32,
    pub total_tx_pkts: u32,
    pub detect_mult: u8,
}

// Result of feeding a sample, when the moving averages complete a cycle
// and a notification should be emitted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlaEmit {
    pub latency: u32,
    pub jitter: u32,
    pub pkt_loss_pct: f32,
}

impl SlaStats {
    // Feeds one round-trip observation into the meter. Returns `Some` on
    // the cycle boundary (every `detect_mult`-th received packet), at
    // which point the accumulators are reset per the reference algorithm
    // (latency and jitter zero, `pkts_lost` carries forward).
    pub fn observe(&mut self, sample: SlaSample) -> Option<SlaEmit> {
        let detect_mult = sample.detect_mult.max(1) as u32;

        self.latency_acc += sample.latency_ms;
        if self.old_latency != 0 {
            self.jitter_acc += self.old_latency.abs_diff(sample.latency_ms);
        }
        self.old_latency = sample.latency_ms;

        if sample.total_rx_pkts % detect_mult != 0 {
            return None;
        }

        if sample.total_rx_pkts % PKTS_TO_CONSIDER_FOR_PKT_LOSS < detect_mult {
            let total_lost = sample
                .total_tx_pkts
                .saturating_sub(sample.total_rx_pkts);
            let delta = total_lost.saturating_sub(self.pkts_lost);
            self.pkt_loss_pct =
                (delta as f32 / PKTS_TO_CONSIDER_FOR_PKT_LOSS as f32) * 100.0;
            self.pkts_lost = total_lost;
        }

        self.latency = self.latency_acc / detect_mult;
        self.jitter = if detect_mult > 1 {
            self.jitter_acc / (detect_mult - 1)
        } else {
            0
        };

        let emit = SlaEmit {
            latency: self.latency,
            jitter: self.jitter,
            pkt_loss_pct: self.pkt_loss_pct,
        };

        self.latency_acc = 0;
        self.jitter_acc = 0;
        self.old_latency = 0;

        Some(emit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sla_cycle_matches_reference_example() {
        let mut sla = SlaStats::default();
        let mut tx = 0u32;
        let mut rx = 0u32;

        let mut last = None;
        for latency in [20, 22, 30] {
            tx += 1;
            rx += 1;
            last = sla.observe(SlaSample {
                latency_ms: latency,
                total_rx_pkts: rx,
                total_tx_pkts: tx,
                detect_mult: 3,
            });
        }

        let emit = last.expect("third sample completes a detect_mult cycle");
        assert_eq!(emit.latency, 24);
        assert_eq!(emit.jitter, 5);

        // Accumulators reset after the emit.
        assert_eq!(sla.latency_acc, 0);
        assert_eq!(sla.jitter_acc, 0);
    }

    #[test]
    fn no_emit_between_cycle_boundaries() {
        let mut sla = SlaStats::default();
        let emit = sla.observe(SlaSample {
            latency_ms: 10,
            total_rx_pkts: 1,
            total_tx_pkts: 1,
            detect_mult: 3,
        });
        assert!(emit.is_none());
    }
}
