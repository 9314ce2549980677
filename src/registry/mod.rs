//! Proxy registry.
//!
//! # Responsibilities
//! - Track every active proxy by name, with its owning session
//! - Serve vhost lookups from an immutable routing snapshot
//! - Enforce cross-session name uniqueness atomically
//!
//! # Design Decisions
//! - The name table is a `DashMap` (per-bucket locking); registration churn
//!   on one proxy never blocks lookups of unrelated entries
//! - The vhost index is an `ArcSwap` snapshot rebuilt after every change:
//!   readers either see the old routing or the new, never a partial update
//! - Deregistration is owner-checked and idempotent; duplicate teardown
//!   messages are absorbed silently

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::pool::WorkConnPool;
use crate::vhost::router::{normalize_host, NoRouteFound, VhostIndex};

/// Errors raised at registration time.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The name belongs to a different session. Rejects this registration
    /// only; the session stays up.
    #[error("proxy name {name:?} is already registered by another session")]
    NameConflict { name: String },
}

/// One active proxy: its config, owner, and work-connection pool.
pub struct RegistryEntry {
    pub name: String,
    pub session_id: Uuid,
    pub config: ProxyConfig,
    /// Registration sequence number; routing ties go to the highest.
    pub seq: u64,
    pub pool: Arc<WorkConnPool>,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Server-wide table of active proxies.
pub struct ProxyRegistry {
    entries: DashMap<String, Arc<RegistryEntry>>,
    index: ArcSwap<VhostIndex>,
    /// Serializes index rebuilds; lookups never touch it.
    rebuild_lock: Mutex<()>,
    seq: AtomicU64,
    subdomain_host: String,
}

impl ProxyRegistry {
    pub fn new(subdomain_host: String) -> Self {
        Self {
            entries: DashMap::new(),
            index: ArcSwap::from_pointee(VhostIndex::default()),
            rebuild_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
            subdomain_host: subdomain_host.to_ascii_lowercase(),
        }
    }

    /// The server's base domain for subdomain registrations, if any.
    pub fn subdomain_host(&self) -> &str {
        &self.subdomain_host
    }

    /// Atomic check-and-insert.
    ///
    /// A collision with another session is rejected. A collision with the
    /// same session replaces the old entry; the replaced entry is returned
    /// so the caller can release its resources.
    pub fn register(
        &self,
        config: ProxyConfig,
        session_id: Uuid,
        pool: Arc<WorkConnPool>,
    ) -> Result<(Arc<RegistryEntry>, Option<Arc<RegistryEntry>>), RegistryError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(RegistryEntry {
            name: config.name.clone(),
            session_id,
            config,
            seq,
            pool,
        });

        let replaced = match self.entries.entry(entry.name.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().session_id != session_id {
                    return Err(RegistryError::NameConflict {
                        name: entry.name.clone(),
                    });
                }
                Some(existing.insert(entry.clone()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                None
            }
        };

        self.rebuild_index();
        tracing::info!(
            proxy = %entry.name,
            kind = %entry.config.kind,
            session = %session_id,
            replaced = replaced.is_some(),
            "proxy registered"
        );
        Ok((entry, replaced))
    }

    /// Remove `name` if `session_id` owns it. A non-owner call is silently
    /// ignored so duplicate teardown messages are harmless.
    pub fn deregister(&self, name: &str, session_id: Uuid) -> Option<Arc<RegistryEntry>> {
        let removed = self
            .entries
            .remove_if(name, |_, entry| entry.session_id == session_id)
            .map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            self.rebuild_index();
            tracing::info!(proxy = %entry.name, session = %session_id, "proxy deregistered");
        }
        removed
    }

    /// Remove every proxy owned by a session, releasing its routing in one
    /// index swap.
    pub fn deregister_session(&self, session_id: Uuid) -> Vec<Arc<RegistryEntry>> {
        let names: Vec<String> = self
            .entries
            .iter()
            .filter(|item| item.value().session_id == session_id)
            .map(|item| item.key().clone())
            .collect();

        let mut removed = Vec::new();
        for name in names {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&name, |_, entry| entry.session_id == session_id)
            {
                removed.push(entry);
            }
        }
        if !removed.is_empty() {
            self.rebuild_index();
        }
        removed
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.get(name).map(|item| item.value().clone())
    }

    /// Resolve an HTTP request to its proxy.
    pub fn lookup_http(&self, host: &str, path: &str) -> Result<Arc<RegistryEntry>, NoRouteFound> {
        let index = self.index.load();
        let binding = index.resolve_http(host, path)?;
        self.lookup_by_name(&binding.proxy_name).ok_or(NoRouteFound {
            host: normalize_host(host),
            path: path.to_string(),
        })
    }

    /// Resolve an HTTPS connection (SNI host) to its proxy.
    pub fn lookup_https(&self, host: &str) -> Result<Arc<RegistryEntry>, NoRouteFound> {
        let index = self.index.load();
        let binding = index.resolve_https(host)?;
        self.lookup_by_name(&binding.proxy_name).ok_or(NoRouteFound {
            host: normalize_host(host),
            path: "/".to_string(),
        })
    }

    /// Number of active proxies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild the vhost snapshot from the current entries and swap it in.
    fn rebuild_index(&self) {
        let _guard = self.rebuild_lock.lock().unwrap();
        let mut index = VhostIndex::default();
        for item in self.entries.iter() {
            let entry = item.value();
            if !entry.config.kind.is_vhost() {
                continue;
            }
            for domain in self.domains_of(&entry.config) {
                index.insert(entry.config.kind, domain, &entry.config, entry.seq);
            }
        }
        self.index.store(Arc::new(index));
    }

    /// Every concrete domain a proxy serves: its custom domains plus the
    /// materialized subdomain, all normalized.
    fn domains_of(&self, config: &ProxyConfig) -> Vec<String> {
        let mut domains: Vec<String> = config
            .custom_domains
            .iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        if let Some(subdomain) = &config.subdomain {
            if !self.subdomain_host.is_empty() {
                domains.push(format!(
                    "{}.{}",
                    subdomain.to_ascii_lowercase(),
                    self.subdomain_host
                ));
            }
        }
        domains
    }
}
