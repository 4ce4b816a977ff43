// src/net/dispatch.rs - Receive-handler dispatch for listening datagram contexts
use crate::net::datagram::DatagramState;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub(crate) type ReceiveHandler = Arc<dyn Fn() + Send + Sync>;

/// Calls each listening context's receive handler once a datagram is waiting.
///
/// Registrations are weak: a context freed by its last owner simply drops
/// out on the next poll. Meant to be polled from the system tick.
#[derive(Clone, Default)]
pub struct DatagramDispatcher {
    registrations: Arc<Mutex<Vec<Weak<Mutex<DatagramState>>>>>,
}

impl DatagramDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<Mutex<DatagramState>>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, ctx: Weak<Mutex<DatagramState>>) {
        let mut list = self.lock();
        if list.iter().any(|w| w.ptr_eq(&ctx)) {
            return;
        }
        list.push(ctx);
        tracing::trace!("datagram dispatcher tracking {} contexts", list.len());
    }

    /// Live registrations.
    pub fn len(&self) -> usize {
        let mut list = self.lock();
        list.retain(|w| w.strong_count() > 0);
        list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the handler of every context with a datagram waiting.
    ///
    /// Handlers run with no lock held, so they may call back into their
    /// context. Returns how many handlers ran.
    pub fn poll_incoming(&self) -> usize {
        let live: Vec<Weak<Mutex<DatagramState>>> = {
            let mut list = self.lock();
            list.retain(|w| w.strong_count() > 0);
            list.clone()
        };
        let mut fired = 0;
        for weak in live {
            let Some(ctx) = weak.upgrade() else {
                continue;
            };
            let handler = ctx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .readable_handler();
            drop(ctx);
            if let Some(handler) = handler {
                handler();
                fired += 1;
            }
        }
        fired
    }
}

impl std::fmt::Debug for DatagramDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramDispatcher")
            .field("registrations", &self.lock().len())
            .finish()
    }
}
