//! # Port-Forward Cache
//!
//! Servers living inside a cluster are reached through a tunnel from a local port to a
//! pod. Creating one is slow, so tunnels are kept per local port and reused as long as
//! they point at the same target.
//!
//! The tunnels themselves are created by an external [`PortForwarder`]. It reports
//! failures asynchronously through the handler it is given; the cache then evicts the
//! tunnel and, when the failing tunnel belongs to the connected server, clears the
//! [`ConnectionMarker`] so the next call reconnects instead of reusing a dead tunnel.
use crate::config::ServerId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The server the engine is currently connected to, shared with tunnel error handlers.
pub type ConnectionMarker = Arc<Mutex<Option<ServerId>>>;

/// Invoked by a [`PortForwarder`] when a tunnel breaks after it was created.
pub type ForwardErrorHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Where to forward a local port to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub namespace: String,
    #[serde(default)]
    pub pod_name: Option<String>,
    /// Label selector used to pick a pod when no name is given.
    #[serde(default)]
    pub pod_name_selector: Option<String>,
    pub local_port: u16,
    pub pod_port: u16,
    #[serde(default)]
    pub cluster_auth: Option<ClusterAuth>,
}

/// The managed cluster credentials are requested for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAuth {
    pub project: String,
    pub location: String,
    pub cluster: String,
}

impl ForwardSpec {
    /// Content hash of the forwarding target. The local port is the cache key and is left out.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.pod_port.to_string());
        for part in [
            Some(self.namespace.as_str()),
            self.pod_name.as_deref(),
            self.pod_name_selector.as_deref(),
        ] {
            hasher.update(b"|");
            hasher.update(part.unwrap_or_default());
        }
        if let Some(auth) = &self.cluster_auth {
            for part in [&auth.project, &auth.location, &auth.cluster] {
                hasher.update(b"|");
                hasher.update(part);
            }
        }
        hex::encode(hasher.finalize())
    }

    fn target(&self) -> String {
        let pod = self
            .pod_name
            .as_deref()
            .or(self.pod_name_selector.as_deref())
            .unwrap_or_default();
        format!("{}/{}:{}", self.namespace, pod, self.pod_port)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ForwardError {
    #[error("Failed to forward local port {local_port} to {target}: {message}")]
    Create {
        local_port: u16,
        target: String,
        message: String,
    },
    #[error("Port forward on local port {local_port} failed: {message}")]
    Broken { local_port: u16, message: String },
}

/// The only handle able to tear a tunnel down.
pub trait ForwardControl: Send + Sync {
    fn close(&self);
    /// What the tunnel printed so far.
    fn output(&self) -> String;
    fn error_output(&self) -> String;
}

/// Creates tunnels.
///
/// `on_error` must only be invoked after `port_forward` has returned.
pub trait PortForwarder: Send + Sync {
    fn port_forward(
        &self,
        spec: &ForwardSpec,
        on_error: ForwardErrorHandler,
    ) -> Result<Box<dyn ForwardControl>, ForwardError>;
}

struct ForwardEntry {
    control: Box<dyn ForwardControl>,
    spec_hash: String,
    /// Tells a tunnel apart from a later one to the same target.
    generation: u64,
}

/// What [`PortForwardCache::ensure_forward`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardHandle {
    pub local_port: u16,
    pub reused: bool,
}

pub struct PortForwardCache {
    forwarder: Arc<dyn PortForwarder>,
    entries: Arc<RwLock<HashMap<u16, ForwardEntry>>>,
    generations: AtomicU64,
    connected: ConnectionMarker,
    errors: mpsc::UnboundedSender<String>,
}

impl PortForwardCache {
    pub fn new(
        forwarder: Arc<dyn PortForwarder>,
        connected: ConnectionMarker,
        errors: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            forwarder,
            entries: Arc::default(),
            generations: AtomicU64::new(0),
            connected,
            errors,
        }
    }

    /// Makes sure `spec.local_port` forwards to the target of `spec` on behalf of `owner`.
    pub fn ensure_forward(
        &self,
        spec: &ForwardSpec,
        owner: ServerId,
    ) -> Result<ForwardHandle, ForwardError> {
        let local_port = spec.local_port;
        let spec_hash = spec.hash();

        if self
            .entries
            .read()
            .get(&local_port)
            .is_some_and(|entry| entry.spec_hash == spec_hash)
        {
            return Ok(ForwardHandle {
                local_port,
                reused: true,
            });
        }

        // Held until the new entry is registered, so a failure reported right after
        // creation finds it.
        let mut entries = self.entries.write();

        if let Some(stale) = entries.remove(&local_port) {
            debug!(local_port, "closing port forward to a different target");
            stale.control.close();
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let handler = self.error_handler(local_port, owner, generation);
        let control = self.forwarder.port_forward(spec, handler)?;
        entries.insert(
            local_port,
            ForwardEntry {
                control,
                spec_hash,
                generation,
            },
        );

        debug!(local_port, target = %spec.target(), "port forward created");

        Ok(ForwardHandle {
            local_port,
            reused: false,
        })
    }

    /// Tears down the tunnel of `local_port`, if any.
    pub fn release(&self, local_port: u16) -> bool {
        match self.entries.write().remove(&local_port) {
            Some(entry) => {
                entry.control.close();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, local_port: u16) -> bool {
        self.entries.read().contains_key(&local_port)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn error_handler(&self, local_port: u16, owner: ServerId, generation: u64) -> ForwardErrorHandler {
        let entries = Arc::clone(&self.entries);
        let connected = Arc::clone(&self.connected);
        let errors = self.errors.clone();

        Arc::new(move |message: String| {
            warn!(local_port, %message, "port forward failed");

            let evicted = {
                let mut entries = entries.write();
                match entries.get(&local_port) {
                    Some(entry) if entry.generation == generation => entries.remove(&local_port),
                    _ => None,
                }
            };
            if let Some(entry) = evicted {
                entry.control.close();
            }

            {
                let mut connected = connected.lock();
                if *connected == Some(owner) {
                    *connected = None;
                }
            }

            let error = ForwardError::Broken {
                local_port,
                message,
            };
            if errors.send(error.to_string()).is_err() {
                debug!(local_port, "error channel closed");
            }
        })
    }
}

impl Drop for PortForwardCache {
    fn drop(&mut self) {
        for (_, entry) in self.entries.write().drain() {
            entry.control.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeControl {
        closed: Arc<AtomicBool>,
    }

    impl ForwardControl for FakeControl {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn output(&self) -> String {
            String::new()
        }

        fn error_output(&self) -> String {
            String::new()
        }
    }

    #[derive(Default)]
    struct FakeForwarder {
        created: AtomicUsize,
        closed: Mutex<Vec<Arc<AtomicBool>>>,
        handlers: Mutex<Vec<ForwardErrorHandler>>,
    }

    impl PortForwarder for FakeForwarder {
        fn port_forward(
            &self,
            _spec: &ForwardSpec,
            on_error: ForwardErrorHandler,
        ) -> Result<Box<dyn ForwardControl>, ForwardError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.handlers.lock().push(on_error);
            let control = FakeControl::default();
            self.closed.lock().push(Arc::clone(&control.closed));
            Ok(Box::new(control))
        }
    }

    fn spec(pod: &str) -> ForwardSpec {
        ForwardSpec {
            namespace: "default".into(),
            pod_name: Some(pod.into()),
            pod_name_selector: None,
            local_port: 8080,
            pod_port: 50051,
            cluster_auth: None,
        }
    }

    fn cache() -> (
        PortForwardCache,
        Arc<FakeForwarder>,
        ConnectionMarker,
        mpsc::UnboundedReceiver<String>,
    ) {
        let forwarder = Arc::new(FakeForwarder::default());
        let connected = ConnectionMarker::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let cache = PortForwardCache::new(forwarder.clone(), connected.clone(), tx);
        (cache, forwarder, connected, rx)
    }

    #[test]
    fn same_spec_creates_one_tunnel() {
        let (cache, forwarder, _, _) = cache();

        let first = cache.ensure_forward(&spec("api-0"), 1).unwrap();
        let second = cache.ensure_forward(&spec("api-0"), 1).unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(forwarder.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_target_replaces_tunnel() {
        let (cache, forwarder, _, _) = cache();

        cache.ensure_forward(&spec("api-0"), 1).unwrap();
        cache.ensure_forward(&spec("api-1"), 1).unwrap();

        assert_eq!(forwarder.created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
        assert!(forwarder.closed.lock()[0].load(Ordering::SeqCst));
        assert!(!forwarder.closed.lock()[1].load(Ordering::SeqCst));
    }

    #[test]
    fn hash_covers_cluster_auth() {
        let plain = spec("api-0");
        let mut with_auth = plain.clone();
        with_auth.cluster_auth = Some(ClusterAuth {
            project: "p".into(),
            location: "europe-west1".into(),
            cluster: "c".into(),
        });
        let mut other_port = plain.clone();
        other_port.local_port = 9090;

        assert_ne!(plain.hash(), with_auth.hash());
        assert_eq!(plain.hash(), other_port.hash());
    }

    #[test]
    fn failure_evicts_and_clears_connected_owner() {
        let (cache, forwarder, connected, mut errors) = cache();
        cache.ensure_forward(&spec("api-0"), 7).unwrap();
        *connected.lock() = Some(7);

        let handler = forwarder.handlers.lock()[0].clone();
        handler("connection reset".into());

        assert!(!cache.contains(8080));
        assert_eq!(*connected.lock(), None);
        assert!(errors.try_recv().unwrap().contains("connection reset"));

        // Next request creates a fresh tunnel.
        let handle = cache.ensure_forward(&spec("api-0"), 7).unwrap();
        assert!(!handle.reused);
    }

    #[test]
    fn failure_of_other_server_keeps_connection() {
        let (cache, forwarder, connected, _) = cache();
        cache.ensure_forward(&spec("api-0"), 7).unwrap();
        *connected.lock() = Some(3);

        let handler = forwarder.handlers.lock()[0].clone();
        handler("broken pipe".into());

        assert!(cache.is_empty());
        assert_eq!(*connected.lock(), Some(3));
    }

    #[test]
    fn late_failure_of_replaced_tunnel_keeps_successor() {
        let (cache, forwarder, _, _) = cache();
        cache.ensure_forward(&spec("api-0"), 7).unwrap();
        let stale = forwarder.handlers.lock()[0].clone();
        cache.release(8080);

        cache.ensure_forward(&spec("api-0"), 7).unwrap();
        stale("tunnel closed".into());

        assert!(cache.contains(8080));
        assert!(!forwarder.closed.lock()[1].load(Ordering::SeqCst));
        assert!(cache.ensure_forward(&spec("api-0"), 7).unwrap().reused);
    }

    #[test]
    fn release_closes_tunnel() {
        let (cache, forwarder, _, _) = cache();
        cache.ensure_forward(&spec("api-0"), 1).unwrap();

        assert!(cache.release(8080));
        assert!(!cache.release(8080));
        assert!(forwarder.closed.lock()[0].load(Ordering::SeqCst));
    }
}
