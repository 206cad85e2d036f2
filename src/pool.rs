//! Backend connection pool.
//!
//! The pool owns every started backend connection together with its
//! capability class and an in-flight usage counter.  Callers take a
//! [`Lease`] with [`BackendPool::acquire`]; dropping the lease releases the
//! connection, so the counter is restored on success, error, early return
//! and cancellation alike.
//!
//! Selection policy:
//!   1. With `prefer_elevated`, the first elevated connection whose
//!      in-flight count is below the concurrency ceiling wins.
//!   2. Otherwise the connection with the lowest in-flight count wins, ties
//!      going to the earliest connection in configuration order.  No ceiling
//!      applies here, so saturated pools oversubscribe rather than queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use metrics::gauge;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::ChunkBackend;
use crate::config::{ConnectionClass, ConnectionConfig};
use crate::metrics::POOL_IN_FLIGHT;

/// Pool failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool holds no connections.
    #[error("no backend connection available")]
    NoBackendAvailable,

    /// Every configured connection failed to start.
    #[error("all {0} configured backend connections failed to start")]
    AllConnectionsFailed(usize),

    /// Two configured connections share an identity.
    #[error("duplicate backend connection identity '{0}'")]
    DuplicateIdentity(String),
}

struct Connection {
    identity: String,
    class: ConnectionClass,
    backend: Arc<dyn ChunkBackend>,
    in_flight: usize,
}

struct PoolInner {
    connections: Mutex<Vec<Connection>>,
    concurrency_ceiling: usize,
    default_identity: String,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct ConnectionSnapshot {
    pub identity: String,
    #[schema(value_type = String)]
    pub class: ConnectionClass,
    pub in_flight: usize,
}

/// Shared handle to the connection pool.
#[derive(Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

impl BackendPool {
    /// Start every backend and build the pool from those that succeed.
    ///
    /// Connections that fail to start are logged and left out for the rest
    /// of the process lifetime.  Fails only when none start.
    pub async fn initialize(
        backends: Vec<(ConnectionConfig, Arc<dyn ChunkBackend>)>,
        concurrency_ceiling: usize,
    ) -> Result<Self, PoolError> {
        let configured = backends.len();
        if configured == 0 {
            return Err(PoolError::NoBackendAvailable);
        }
        // Leases release and evict by identity.
        {
            let mut seen = HashSet::new();
            for (cfg, _) in &backends {
                if !seen.insert(cfg.identity.as_str()) {
                    return Err(PoolError::DuplicateIdentity(cfg.identity.clone()));
                }
            }
        }

        let started = join_all(backends.into_iter().map(|(cfg, backend)| async move {
            match backend.start().await {
                Ok(()) => {
                    info!("Backend connection '{}' ({}) started", cfg.identity, cfg.class);
                    Some(Connection {
                        identity: cfg.identity,
                        class: cfg.class,
                        backend,
                        in_flight: 0,
                    })
                }
                Err(e) => {
                    error!("Backend connection '{}' failed to start: {}", cfg.identity, e);
                    None
                }
            }
        }))
        .await;

        let connections: Vec<Connection> = started.into_iter().flatten().collect();
        if connections.is_empty() {
            return Err(PoolError::AllConnectionsFailed(configured));
        }

        let default_identity = connections
            .iter()
            .find(|c| c.class == ConnectionClass::Elevated)
            .unwrap_or(&connections[0])
            .identity
            .clone();
        info!(
            "Backend pool ready: {} of {} connections, default '{}'",
            connections.len(),
            configured,
            default_identity
        );
        for c in &connections {
            gauge!(POOL_IN_FLIGHT, "connection" => c.identity.clone()).set(0.0);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                connections: Mutex::new(connections),
                concurrency_ceiling,
                default_identity,
            }),
        })
    }

    /// Take a connection according to the selection policy.
    pub fn acquire(&self, prefer_elevated: bool) -> Result<Lease, PoolError> {
        let mut conns = self.inner.connections.lock().expect("mutex poisoned");

        let elevated = if prefer_elevated {
            conns.iter().position(|c| {
                c.class == ConnectionClass::Elevated && c.in_flight < self.inner.concurrency_ceiling
            })
        } else {
            None
        };
        // min_by_key keeps the first of equal minima.
        let index = elevated
            .or_else(|| {
                conns
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.in_flight)
                    .map(|(i, _)| i)
            })
            .ok_or(PoolError::NoBackendAvailable)?;

        let conn = &mut conns[index];
        conn.in_flight += 1;
        gauge!(POOL_IN_FLIGHT, "connection" => conn.identity.clone()).set(conn.in_flight as f64);
        debug!(
            "Acquired '{}' ({}), in flight {}",
            conn.identity, conn.class, conn.in_flight
        );

        Ok(Lease {
            pool: self.clone(),
            identity: conn.identity.clone(),
            class: conn.class,
            backend: conn.backend.clone(),
        })
    }

    /// Decrement the in-flight count of `identity`, never below zero.
    ///
    /// Unknown identities (evicted connections) are ignored.
    pub fn release(&self, identity: &str) {
        let mut conns = self.inner.connections.lock().expect("mutex poisoned");
        if let Some(conn) = conns.iter_mut().find(|c| c.identity == identity) {
            conn.in_flight = conn.in_flight.saturating_sub(1);
            gauge!(POOL_IN_FLIGHT, "connection" => conn.identity.clone()).set(conn.in_flight as f64);
            debug!("Released '{}', in flight {}", conn.identity, conn.in_flight);
        }
    }

    /// Remove a connection whose session was revoked. It is never re-created.
    pub fn evict(&self, identity: &str) {
        let removed = {
            let mut conns = self.inner.connections.lock().expect("mutex poisoned");
            let before = conns.len();
            conns.retain(|c| c.identity != identity);
            before != conns.len()
        };
        if removed {
            warn!("Backend connection '{}' evicted from the pool", identity);
            gauge!(POOL_IN_FLIGHT, "connection" => identity.to_string()).set(0.0);
        }
    }

    /// Per-connection usage, in configuration order.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let conns = self.inner.connections.lock().expect("mutex poisoned");
        conns
            .iter()
            .map(|c| ConnectionSnapshot {
                identity: c.identity.clone(),
                class: c.class,
                in_flight: c.in_flight,
            })
            .collect()
    }

    /// Identity chosen as the default at initialization (diagnostics only).
    pub fn default_connection(&self) -> &str {
        &self.inner.default_identity
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().expect("mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every connection. Errors are logged, not returned.
    pub async fn shutdown(&self) {
        let backends: Vec<(String, Arc<dyn ChunkBackend>)> = {
            let conns = self.inner.connections.lock().expect("mutex poisoned");
            conns
                .iter()
                .map(|c| (c.identity.clone(), c.backend.clone()))
                .collect()
        };
        for (identity, backend) in backends {
            if let Err(e) = backend.stop().await {
                warn!("Backend connection '{}' failed to stop cleanly: {}", identity, e);
            }
        }
        info!("Backend pool shut down");
    }
}

/// A connection taken from the pool. Released on drop.
pub struct Lease {
    pool: BackendPool,
    identity: String,
    class: ConnectionClass,
    backend: Arc<dyn ChunkBackend>,
}

impl Lease {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn class(&self) -> ConnectionClass {
        self.class
    }

    pub fn backend(&self) -> &Arc<dyn ChunkBackend> {
        &self.backend
    }

    /// Drop this connection from the pool, e.g. after its session was revoked.
    pub fn evict(&self) {
        self.pool.evict(&self.identity);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("identity", &self.identity)
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.release(&self.identity);
    }
}
