//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::sleep_until;

// A self-rearming one-shot timer.
//
// Unlike a fixed-interval timer, a `Timer` doesn't know its next delay in
// advance: every time it fires, the caller supplies a fresh duration (the
// transmit timer needs a newly jittered delay on every shot; the detection
// timer needs whatever the currently negotiated detection time is), so it
// re-evaluates the delay via a closure on each firing rather than reusing a
// fixed one.
pub struct Timer {
    tx: mpsc::UnboundedSender<TimerMsg>,
    next_fire: Arc<Mutex<Instant>>,
}

enum TimerMsg {
    Reset(Duration),
    Cancel,
}

impl Timer {
    // Spawns a new timer that invokes `callback` every time it fires, and
    // immediately arms it with `next(callback_state)`'s returned delay.
    //
    // `next` is called once up front and again after every firing to
    // compute the delay for the *following* shot, allowing callers (e.g.
    // the transmit timer) to re-jitter on every cycle.
    pub fn new<F, N>(initial: Duration, mut callback: F, mut next: N) -> Self
    where
        F: FnMut() + Send + 'static,
        N: FnMut() -> Duration + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerMsg>();
        let next_fire = Arc::new(Mutex::new(Instant::now() + initial));
        let next_fire2 = next_fire.clone();

        tokio::spawn(async move {
            let mut deadline = Instant::now() + initial;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline.into()) => {
                        callback();
                        let delay = next();
                        deadline = Instant::now() + delay;
                        *next_fire2.lock().unwrap() = deadline;
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(TimerMsg::Reset(delay)) => {
                                deadline = Instant::now() + delay;
                                *next_fire2.lock().unwrap() = deadline;
                            }
                            Some(TimerMsg::Cancel) | None => break,
                        }
                    }
                }
            }
        });

        Timer { tx, next_fire }
    }

    // Reschedules the timer to fire after `delay` from now, discarding
    // whatever was previously pending. Used when a negotiated interval
    // changes (e.g. after a Poll sequence completes).
    pub fn reset(&self, delay: Duration) {
        let _ = self.tx.send(TimerMsg::Reset(delay));
    }

    pub fn remaining(&self) -> Duration {
        self.next_fire
            .lock()
            .unwrap()
            .saturating_duration_since(Instant::now())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerMsg::Cancel);
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("remaining", &self.remaining())
            .finish()
    }
}
