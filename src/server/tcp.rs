//! Public listeners for `tcp` proxies.
//!
//! Each registered `tcp` proxy gets its own listener; every accepted public
//! connection is spliced 1:1 onto a pooled work connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::observability::metrics;
use crate::pool::PoolError;
use crate::registry::RegistryEntry;

/// Accept loop for one `tcp` proxy. Aborted by the owning session on
/// deregistration or teardown.
pub async fn serve_tcp_proxy(
    listener: TcpListener,
    entry: Arc<RegistryEntry>,
    take_timeout: Duration,
) {
    let addr = listener.local_addr().ok();
    tracing::info!(proxy = %entry.name, address = ?addr, "tcp proxy listening");

    loop {
        let (public, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(proxy = %entry.name, error = %e, "tcp accept failed");
                continue;
            }
        };
        let entry = entry.clone();
        tokio::spawn(async move {
            tracing::debug!(proxy = %entry.name, peer = %peer, "tcp connection accepted");
            splice_public_conn(public, entry, take_timeout).await;
        });
    }
}

async fn splice_public_conn(
    mut public: TcpStream,
    entry: Arc<RegistryEntry>,
    take_timeout: Duration,
) {
    let mut conn = match entry.pool.take(take_timeout).await {
        Ok(conn) => conn,
        Err(PoolError::Timeout) => {
            tracing::warn!(proxy = %entry.name, "timed out waiting for a work connection");
            metrics::record_tcp_splice(&entry.name, false);
            return;
        }
        Err(PoolError::Closed) => {
            tracing::debug!(proxy = %entry.name, "pool closed while a public connection waited");
            metrics::record_tcp_splice(&entry.name, false);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut public, &mut conn).await {
        Ok((to_backend, to_public)) => {
            tracing::debug!(
                proxy = %entry.name,
                to_backend,
                to_public,
                "tcp connection finished"
            );
            metrics::record_tcp_splice(&entry.name, true);
        }
        Err(e) => {
            tracing::debug!(proxy = %entry.name, error = %e, "tcp splice ended with error");
            metrics::record_tcp_splice(&entry.name, false);
        }
    }
}
