//! Listener lifecycle and graceful shutdown
//!
//! One task per accepted connection. Each connection is registered in a
//! tracked set with its cancellation token before the handler runs;
//! shutdown closes the listener and then poll-cancels the set on an
//! exponentially backed-off interval until it drains or the deadline
//! passes. Handlers do blocking socket IO, so repeated cancellation is the
//! drain mechanism, and the backoff keeps the poll from busy-waiting.

use crate::ca::CertAuthority;
use crate::dialer::UpstreamDialer;
use crate::error::{Error, Result};
use crate::handler::ConnectionHandler;
use crate::keylog::KeyLogWriter;
use futures::FutureExt;
use rand::Rng;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const DRAIN_POLL_START: Duration = Duration::from_millis(1);
const DRAIN_POLL_CAP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Idle,
  Listening,
  Closed,
}

/// The MITM proxy server. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ProxyServer {
  shared: Arc<Shared>,
}

struct Shared {
  handler: ConnectionHandler,
  key_log: Option<Arc<KeyLogWriter>>,
  tracked: Mutex<HashMap<u64, CancellationToken>>,
  next_id: AtomicU64,
  active: Arc<AtomicUsize>,
  state: Mutex<State>,
  stop: CancellationToken,
}

impl ProxyServer {
  pub fn new(
    ca: Arc<CertAuthority>,
    dialer: Arc<UpstreamDialer>,
    key_log: Option<Arc<KeyLogWriter>>,
  ) -> Self {
    let active = Arc::new(AtomicUsize::new(0));
    Self {
      shared: Arc::new(Shared {
        handler: ConnectionHandler::new(ca, dialer, active.clone()),
        key_log,
        tracked: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        active,
        state: Mutex::new(State::Idle),
        stop: CancellationToken::new(),
      }),
    }
  }

  /// Bind `addr` and serve until [`ProxyServer::shutdown`] closes the
  /// listener, at which point this returns `Error::ServerClosed`.
  pub async fn run(&self, addr: &str) -> Result<()> {
    {
      let mut state = self.shared.state.lock().unwrap();
      match *state {
        State::Idle => *state = State::Listening,
        State::Listening => return Err(Error::AlreadyListening),
        State::Closed => return Err(Error::ServerClosed),
      }
    }
    let listener = match TcpListener::bind(addr).await {
      Ok(listener) => listener,
      Err(e) => {
        *self.shared.state.lock().unwrap() = State::Idle;
        return Err(e.into());
      }
    };
    tracing::info!("proxy server listening on {addr}");

    loop {
      let accepted = tokio::select! {
        _ = self.shared.stop.cancelled() => return Err(Error::ServerClosed),
        accepted = listener.accept() => accepted,
      };
      let (stream, peer_addr) = match accepted {
        Ok(pair) => pair,
        Err(e) => {
          if self.shared.stop.is_cancelled() {
            return Err(Error::ServerClosed);
          }
          tracing::error!("proxy: accept: {e}");
          continue;
        }
      };

      let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
      let cancel = CancellationToken::new();
      // registered before the handler can run, so a concurrent shutdown
      // already sees this connection
      self
        .shared
        .tracked
        .lock()
        .unwrap()
        .insert(id, cancel.clone());
      self.shared.active.fetch_add(1, Ordering::Relaxed);

      let shared = self.shared.clone();
      tokio::spawn(async move {
        let serve = shared.handler.handle(stream, cancel);
        if let Err(panic) = AssertUnwindSafe(serve).catch_unwind().await {
          tracing::error!("proxy: panic serving {peer_addr}: {}", panic_message(&*panic));
        }
        shared.active.fetch_sub(1, Ordering::Relaxed);
        shared.tracked.lock().unwrap().remove(&id);
      });
    }
  }

  /// Stop accepting, close the key log, cancel every tracked connection
  /// on each drain poll, and return once the set is empty. Fails with
  /// `ShutdownTimeout` when connections outlive the deadline.
  pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
    *self.shared.state.lock().unwrap() = State::Closed;
    self.shared.stop.cancel();
    if let Some(key_log) = &self.shared.key_log {
      key_log.close();
    }

    let started = Instant::now();
    let mut interval = DRAIN_POLL_START;
    loop {
      let tokens: Vec<CancellationToken> = {
        let tracked = self.shared.tracked.lock().unwrap();
        tracked.values().cloned().collect()
      };
      if tokens.is_empty() {
        return Ok(());
      }
      for token in tokens {
        token.cancel();
      }

      let elapsed = started.elapsed();
      if elapsed >= deadline {
        return Err(Error::ShutdownTimeout);
      }
      tokio::time::sleep(jitter(interval).min(deadline - elapsed)).await;
      interval = (interval * 2).min(DRAIN_POLL_CAP);
    }
  }

  /// Connections currently being served.
  pub fn active_connections(&self) -> usize {
    self.shared.active.load(Ordering::Relaxed)
  }
}

/// ±10% so synchronized pollers spread out.
fn jitter(interval: Duration) -> Duration {
  interval.mul_f64(rand::thread_rng().gen_range(0.9..=1.1))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message
  } else {
    "unknown panic payload"
  }
}
