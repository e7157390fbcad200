//! TCP dispatch: routed dial raced against a forced direct dial.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::copy_bidirectional;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Tunnel;
use crate::adapter::{BoxStream, Direct, Proxy};
use crate::error::Error;
use crate::inbound::InboundConn;
use crate::metadata::Metadata;
use crate::rules::Rule;
use crate::tracker::TcpTracker;

pub(super) async fn run_dispatch_loop(tunnel: Arc<Tunnel>, mut queue: mpsc::Receiver<InboundConn>) {
    while let Some(conn) = queue.recv().await {
        handle_tcp_conn(tunnel.clone(), conn);
    }
    debug!("[TCP] dispatch loop stopped");
}

struct RaceState {
    /// 1 until an attempt claims the inbound.
    conn_counter: u8,
    /// Attempts still running.
    done_counter: u8,
    inbound: Option<InboundConn>,
}

/// State shared by the two attempts of one inbound connection.
struct Race {
    metadata: Metadata,
    state: Mutex<RaceState>,
}

impl Race {
    fn lock(&self) -> MutexGuard<'_, RaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the inbound if no attempt has claimed it yet.
    fn claim(&self) -> Option<InboundConn> {
        let mut state = self.lock();
        if state.conn_counter == 0 {
            return None;
        }
        state.conn_counter -= 1;
        state.inbound.take()
    }
}

/// Marks one attempt finished when dropped. The last attempt out closes an
/// unclaimed inbound.
struct Attempt {
    race: Arc<Race>,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        let orphan = {
            let mut state = self.race.lock();
            state.done_counter -= 1;
            if state.done_counter == 0 && state.conn_counter > 0 {
                state.inbound.take()
            } else {
                None
            }
        };
        if let Some(inbound) = orphan {
            warn!(
                "[TCP] {} --> {} no outbound connected, closing",
                inbound.metadata().source_address(),
                inbound.metadata().remote_address()
            );
        }
    }
}

fn handle_tcp_conn(tunnel: Arc<Tunnel>, conn: InboundConn) {
    let race = Arc::new(Race {
        metadata: conn.metadata().clone(),
        state: Mutex::new(RaceState {
            conn_counter: 1,
            done_counter: 2,
            inbound: Some(conn),
        }),
    });

    tokio::spawn(attempt(tunnel.clone(), race.clone(), true));
    tokio::spawn(attempt(tunnel, race, false));
}

async fn attempt(tunnel: Arc<Tunnel>, race: Arc<Race>, force_direct: bool) {
    let _attempt = Attempt { race: race.clone() };

    if force_direct && !tunnel.breaker.is_open() {
        return;
    }

    let mut metadata = race.metadata.clone();
    if !metadata.valid() {
        warn!("[Metadata] not valid: {:?}", metadata);
        return;
    }
    if let Err(e) = tunnel.pre_handle_metadata(&mut metadata) {
        debug!("[Metadata PreHandle] error: {}", e);
        return;
    }

    let (proxy, rule) = if force_direct {
        match tunnel.proxies().get(Direct::NAME) {
            Some(proxy) => (proxy.clone(), None),
            None => {
                warn!("[TCP] {}", Error::ProxyNotFound(Direct::NAME.to_string()));
                return;
            }
        }
    } else {
        match tunnel.resolve_metadata(&mut metadata).await {
            Ok(route) => route,
            Err(e) => {
                warn!("[Metadata] parse failed: {}", e);
                return;
            }
        }
    };

    if proxy.name() == Direct::NAME && metadata.dst_port == 53 {
        return;
    }

    let remote = match proxy.dial(&metadata).await {
        Ok(remote) => remote,
        Err(source) => {
            if !force_direct {
                tunnel.breaker.record_failure();
            }
            let e = Error::Dial {
                proxy: proxy.name().to_string(),
                source,
            };
            warn!("{}", e);
            return;
        }
    };
    if !force_direct {
        tunnel.breaker.record_success();
    }

    let Some(inbound) = race.claim() else {
        debug!("[TCP] {} lost the race, closing", proxy.name());
        return;
    };

    relay(&tunnel, inbound, remote, &metadata, proxy.as_ref(), rule).await;
}

async fn relay(
    tunnel: &Tunnel,
    inbound: InboundConn,
    remote: BoxStream,
    metadata: &Metadata,
    proxy: &dyn Proxy,
    rule: Option<Arc<dyn Rule>>,
) {
    let mut remote = TcpTracker::new(
        remote,
        tunnel.manager.clone(),
        metadata,
        proxy.chains(),
        rule.as_deref(),
    );
    tunnel.log_route(metadata, rule.as_ref(), remote.chains());

    let kind = inbound.kind();
    let mut local = inbound.into_stream();
    let copied = copy_bidirectional(&mut local, &mut remote).await;
    match copied {
        Ok((up, down)) => debug!(
            id = remote.id(),
            "[{kind}] {} closed, up={up} down={down}",
            metadata.remote_address()
        ),
        Err(e) => debug!(id = remote.id(), "[{kind}] relay error: {}", e),
    }
}
