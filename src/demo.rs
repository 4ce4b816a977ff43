// src/demo.rs - UDP echo sketch driving the datagram transport from firmware code
use crate::config::DatagramConfig;
use crate::net::{DatagramContext, DatagramDispatcher, TransportError};
use hostmock_shared::{Cooperative, EmuResult, Sketch};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the sketch and whoever watches it.
#[derive(Debug, Default)]
pub struct EchoStats {
    pub notified: AtomicU64,
    pub echoed: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EchoSnapshot {
    pub notified: u64,
    pub echoed: u64,
    pub failed: u64,
}

impl EchoStats {
    pub fn snapshot(&self) -> EchoSnapshot {
        EchoSnapshot {
            notified: self.notified.load(Ordering::Acquire),
            echoed: self.echoed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

/// Listens on `bind` and sends every datagram back to its sender.
pub struct UdpEcho {
    ctx: DatagramContext,
    bind: SocketAddr,
    idle_ms: u32,
    stats: Arc<EchoStats>,
}

impl UdpEcho {
    pub fn new(config: &DatagramConfig, dispatcher: &DatagramDispatcher, bind: SocketAddr) -> Self {
        Self {
            ctx: DatagramContext::with_dispatcher(config, dispatcher),
            bind,
            idle_ms: 1,
            stats: Arc::new(EchoStats::default()),
        }
    }

    /// How long the loop sleeps when nothing is queued.
    pub fn with_idle_ms(mut self, idle_ms: u32) -> Self {
        self.idle_ms = idle_ms;
        self
    }

    pub fn stats(&self) -> Arc<EchoStats> {
        self.stats.clone()
    }

    /// Another reference to the listening context.
    pub fn context(&self) -> DatagramContext {
        self.ctx.acquire()
    }

    fn echo_held(&self) -> Result<(), TransportError> {
        let mut payload = vec![0u8; self.ctx.remaining()];
        self.ctx.read(&mut payload)?;
        self.ctx.append(&payload)?;
        self.ctx.send(self.ctx.remote_addr())?;
        Ok(())
    }
}

impl Sketch for UdpEcho {
    fn setup(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
        let stats = self.stats.clone();
        self.ctx.on_receive(move || {
            stats.notified.fetch_add(1, Ordering::AcqRel);
        });
        if let Err(e) = self.ctx.listen(self.bind.ip(), self.bind.port(), None) {
            tracing::error!("udp-echo: cannot listen on {}: {}", self.bind, e);
            return cx.exit();
        }
        match self.ctx.local_addr() {
            Ok(Some(addr)) => tracing::info!("udp-echo: listening on {}", addr),
            Ok(None) => {}
            Err(e) => tracing::warn!("udp-echo: {}", e),
        }
        Ok(())
    }

    fn loop_body(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
        loop {
            match self.ctx.next() {
                Ok(true) => match self.echo_held() {
                    Ok(()) => {
                        self.stats.echoed.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        self.stats.failed.fetch_add(1, Ordering::AcqRel);
                        tracing::warn!(
                            "udp-echo: echo to {:?} failed: {}",
                            self.ctx.remote_addr(),
                            e
                        );
                    }
                },
                Ok(false) => break,
                Err(e) if e.is_fatal() => {
                    self.stats.failed.fetch_add(1, Ordering::AcqRel);
                    tracing::error!("udp-echo: receive failed: {}", e);
                    break;
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::AcqRel);
                    tracing::warn!("udp-echo: {}", e);
                }
            }
            cx.yield_now()?;
        }
        cx.delay(self.idle_ms)
    }

    fn name(&self) -> &str {
        "udp-echo"
    }
}
