//! Token-bucket I/O throttle shared by all copy workers.
//!
//! A ticker thread refills the bucket to `rate` tokens every interval; each
//! read iteration takes one token and blocks while the bucket is empty.
//! Stopping the throttle disables it and releases every waiter.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::Result;

#[derive(Debug)]
struct State {
    tokens: u64,
    enabled: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    refilled: Condvar,
    stop: Mutex<bool>,
    stop_cond: Condvar,
}

#[derive(Debug)]
pub struct Throttle {
    inner: Arc<Inner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Throttle {
    /// A throttle that never blocks.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tokens: 0,
                    enabled: false,
                }),
                refilled: Condvar::new(),
                stop: Mutex::new(true),
                stop_cond: Condvar::new(),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Allow `rate` I/O operations per second; `0` disables throttling.
    pub fn new(rate: u64) -> Result<Self> {
        Self::with_interval(rate, Duration::from_secs(1))
    }

    pub fn with_interval(rate: u64, interval: Duration) -> Result<Self> {
        if rate == 0 {
            return Ok(Self::disabled());
        }
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                tokens: rate,
                enabled: true,
            }),
            refilled: Condvar::new(),
            stop: Mutex::new(false),
            stop_cond: Condvar::new(),
        });

        let ticker_inner = Arc::clone(&inner);
        let ticker = thread::Builder::new()
            .name("io-throttle".into())
            .spawn(move || {
                let mut stopped = ticker_inner.stop.lock();
                loop {
                    let deadline = Instant::now() + interval;
                    while !*stopped {
                        if ticker_inner
                            .stop_cond
                            .wait_until(&mut stopped, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    if *stopped {
                        break;
                    }
                    let mut state = ticker_inner.state.lock();
                    state.tokens = rate;
                    ticker_inner.refilled.notify_all();
                }
            })?;

        debug!(rate, "io throttle started");
        Ok(Self {
            inner,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// Take one token, waiting for the next refill if none is left.
    pub fn acquire(&self) {
        let mut state = self.inner.state.lock();
        loop {
            if !state.enabled {
                return;
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            self.inner.refilled.wait(&mut state);
        }
    }

    /// Stop the ticker and disable throttling; blocked callers resume.
    pub fn stop(&self) {
        {
            let mut stopped = self.inner.stop.lock();
            *stopped = true;
            self.inner.stop_cond.notify_all();
        }
        {
            let mut state = self.inner.state.lock();
            state.enabled = false;
            self.inner.refilled.notify_all();
        }
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.stop();
    }
}
