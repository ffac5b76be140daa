//! Userspace TCP relay backend
//!
//! Needs no privileges for ports above 1023. Each mapping gets a listener on
//! `local_port` and an accept loop that relays every connection to the
//! remote endpoint. Connection tasks live in a `JoinSet` owned by the accept
//! loop, so aborting the loop also tears down its open connections.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::core::adapter::FirewallAdapter;
use crate::core::error::AdapterFailure;
use crate::core::rule::Mapping;

pub struct ProxyAdapter {
    runtime: Runtime,
    listeners: Mutex<HashMap<Mapping, JoinHandle<()>>>,
}

impl ProxyAdapter {
    /// # Errors
    ///
    /// Returns `Err` if the tokio runtime cannot be built.
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("ipf-proxy")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Number of mappings with a live listener
    pub fn listener_count(&self) -> usize {
        self.listeners().map(|l| l.len()).unwrap_or(0)
    }

    fn listeners(&self) -> Result<MutexGuard<'_, HashMap<Mapping, JoinHandle<()>>>, AdapterFailure> {
        self.listeners.lock().map_err(|_| {
            error!("proxy listener lock poisoned");
            AdapterFailure::Unknown
        })
    }
}

impl FirewallAdapter for ProxyAdapter {
    fn install(&self, mapping: &Mapping, allow_lan: bool) -> Result<(), AdapterFailure> {
        let mut listeners = self.listeners()?;
        if listeners.contains_key(mapping) {
            return Err(AdapterFailure::AlreadyExists);
        }

        let bind_ip = if allow_lan {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let bind_addr = SocketAddr::new(bind_ip, mapping.local_port);

        let listener = self
            .runtime
            .block_on(TcpListener::bind(bind_addr))
            .map_err(|e| {
                warn!("Cannot listen on {bind_addr}: {e}");
                AdapterFailure::from(e)
            })?;

        debug!("Listening on {bind_addr} for {mapping}");
        let handle = self.runtime.spawn(accept_loop(listener, mapping.remote()));
        listeners.insert(*mapping, handle);
        Ok(())
    }

    fn remove(&self, mapping: &Mapping) -> Result<(), AdapterFailure> {
        let handle = self.listeners()?.remove(mapping).ok_or_else(|| {
            debug!("{mapping} is not installed");
            AdapterFailure::Unknown
        })?;

        handle.abort();
        // Wait for the listener to be dropped so the port is free on return
        let _ = self.runtime.block_on(handle);
        info!("Stopped relaying {mapping}");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "proxy"
    }
}

impl Drop for ProxyAdapter {
    fn drop(&mut self) {
        if let Ok(listeners) = self.listeners.get_mut() {
            for (_, handle) in listeners.drain() {
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for ProxyAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAdapter")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

/// Delay after a failed `accept()`, doubling up to a cap and reset by the
/// next successful accept. Errors like `EMFILE` persist until a descriptor
/// is freed, so retrying immediately would spin.
#[derive(Debug)]
struct AcceptBackoff {
    delay: Duration,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    const fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    /// Returns the delay to sleep now and grows the next one.
    fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        current
    }

    const fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }
}

async fn accept_loop(listener: TcpListener, remote: SocketAddr) {
    let mut connections = JoinSet::new();
    let mut backoff = AcceptBackoff::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((ingress, peer)) => {
                    backoff.reset();
                    debug!("Accepted {peer}, relaying to {remote}");
                    connections.spawn(relay(ingress, remote));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("Accept failed for relay to {remote}, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                }
            },
            // Reap finished connections so the set does not grow unbounded
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn relay(mut ingress: TcpStream, remote: SocketAddr) {
    let mut egress = match TcpStream::connect(remote).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot connect to {remote}: {e}");
            return;
        }
    };

    let copy_result = copy_bidirectional(&mut ingress, &mut egress).await;
    let _ = ingress.shutdown().await;
    let _ = egress.shutdown().await;

    match copy_result {
        Ok((to_remote, to_local)) => {
            debug!("Relay to {remote} closed ({to_remote} bytes out, {to_local} bytes in)");
        }
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::ConnectionReset
            ) => {}
        Err(e) => warn!("Relay to {remote} failed: {e}"),
    }
}
