//! The demo service: a ticker that counts beats until stopped.

use hearth_core::{HookError, Service, ServiceContext};
use hearth_schema::CommandLine;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

struct Ticker {
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct Heartbeat {
    interval: Duration,
    beats: Arc<AtomicU64>,
    ticker: Mutex<Option<Ticker>>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            beats: Arc::new(AtomicU64::new(0)),
            ticker: Mutex::new(None),
        }
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }

    fn beat(&self) -> u64 {
        self.beats.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Service for Heartbeat {
    fn start(&self, ctx: &ServiceContext) -> Result<(), HookError> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Ok(());
        }

        let (stop, rx) = mpsc::channel::<()>();
        let beats = Arc::clone(&self.beats);
        let interval = self.interval;
        let span = ctx.span().clone();
        let handle = thread::Builder::new()
            .name("heartbeat".to_owned())
            .spawn(move || {
                let _entered = span.enter();
                // Sender dropped or signalled: stop ticking
                while let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
                    let n = beats.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(beat = n, "beat");
                }
            })?;
        *ticker = Some(Ticker { stop, handle });

        info!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            mode = %ctx.execution_mode(),
            "heartbeat started"
        );
        Ok(())
    }

    fn process(&self, ctx: &ServiceContext, args: &CommandLine) -> Result<Option<String>, HookError> {
        let mut replies = Vec::new();
        for word in args.args() {
            match word.as_str() {
                "ping" => replies.push(format!("pong beats={}", self.beats())),
                "beat" => replies.push(format!("beat {}", self.beat())),
                "mode" => replies.push(format!("execution-mode={}", ctx.execution_mode())),
                other => return Err(format!("unknown command '{other}'").into()),
            }
        }
        Ok((!replies.is_empty()).then(|| replies.join("\n")))
    }

    fn stop(&self, _ctx: &ServiceContext) -> Result<(), HookError> {
        let Some(ticker) = self.ticker.lock().take() else {
            return Ok(());
        };
        let _ = ticker.stop.send(());
        if ticker.handle.join().is_err() {
            return Err("heartbeat thread panicked".into());
        }
        info!(beats = self.beats(), "heartbeat stopped");
        Ok(())
    }
}
