//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use rand::Rng;

// Generates BFD local discriminators.
//
// Discriminators are monotonically increasing starting from 1, matching
// the reference implementation's generator (which never reuses a value
// within a process lifetime). 0 is reserved ("no discriminator yet") by
// RFC 5880 and is never handed out.
#[derive(Debug, Default)]
pub struct DiscriminatorGen {
    next: u32,
}

impl DiscriminatorGen {
    pub fn new() -> Self {
        DiscriminatorGen { next: 1 }
    }

    // Returns the next unused discriminator, skipping any value already
    // claimed by an explicitly configured session.
    pub fn alloc(&mut self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        let start = self.next;
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                self.next = 1;
            }
            if candidate != 0 && !in_use(candidate) {
                return Some(candidate);
            }
            if self.next == start {
                // Wrapped all the way around without finding a free slot.
                return None;
            }
        }
    }
}

// Computes the jittered transmit interval for the next control packet,
// per RFC 5880 §6.8.7: the actual value used is a random value between 75%
// and 100% of `min_tx`, except that when detect_mult is 1, the upper bound
// is reduced to 90% to avoid synchronization with the remote peer.
pub fn jittered_tx_interval<R: Rng + ?Sized>(
    rng: &mut R,
    min_tx: std::time::Duration,
    detect_mult: u8,
) -> std::time::Duration {
    let span: u32 = if detect_mult == 1 { 15 } else { 25 };
    let percent = 75 + rng.gen_range(0..span);
    min_tx * percent / 100
}
