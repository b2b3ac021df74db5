use super::protocol::ServiceName;
use crate::error::{MuxError, Result};
use std::collections::HashMap;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Table of live registrations, keyed by canonical service name.
///
/// Insert and lookup each take the lock once and never hold it across an
/// await, so a registration is visible only after its uniqueness check and
/// insertion have both completed.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    services: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

struct Entry {
    id: u64,
    handoff: flume::Sender<OwnedFd>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn services(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave a half-written entry:
        // every mutation is a single HashMap call.
        self.inner
            .services
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `name`. The returned [`Registration`] is the sole consumer of
    /// the service's handoff queue; dropping it removes the entry.
    pub fn insert(&self, name: &[u8]) -> Result<Registration> {
        let name = ServiceName::parse(name)?;
        let (tx, rx) = flume::bounded(0);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut services = self.services();
        if services.contains_key(name.as_str()) {
            return Err(MuxError::AlreadyExists(name.to_string()));
        }
        services.insert(name.as_str().to_owned(), Entry { id, handoff: tx });
        drop(services);

        info!(service = %name, id, "Service registered");
        Ok(Registration {
            name,
            id,
            handoff: rx,
            registry: self.clone(),
        })
    }

    pub fn lookup(&self, name: &[u8]) -> Result<ServiceHandle> {
        let name = ServiceName::parse(name)?;
        let services = self.services();
        match services.get(name.as_str()) {
            Some(entry) => Ok(ServiceHandle {
                handoff: entry.handoff.clone(),
                name,
            }),
            None => Err(MuxError::NotFound(name.to_string())),
        }
    }

    /// Remove `name` if it is still held by registration `id`.
    pub fn remove(&self, name: &str, id: u64) -> bool {
        let mut services = self.services();
        match services.get(name) {
            Some(entry) if entry.id == id => {
                services.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.services().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services().keys().cloned().collect();
        names.sort();
        names
    }
}

/// A live registration, owned by the registrant connection that created it.
pub struct Registration {
    name: ServiceName,
    id: u64,
    handoff: flume::Receiver<OwnedFd>,
    registry: Registry,
}

impl Registration {
    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next connection routed to this service.
    pub async fn next_handoff(&self) -> Option<OwnedFd> {
        self.handoff.recv_async().await.ok()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(self.name.as_str(), self.id) {
            info!(service = %self.name, id = self.id, "Service deregistered");
        }
    }
}

/// Producer side of a registration's rendezvous queue.
#[derive(Clone)]
pub struct ServiceHandle {
    name: ServiceName,
    handoff: flume::Sender<OwnedFd>,
}

impl ServiceHandle {
    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    /// Queue `fd` for the registrant, waiting until its serve loop takes it.
    ///
    /// If the registration goes away first the descriptor is closed and
    /// `ConnectionReset` is returned.
    pub async fn dispatch(&self, fd: OwnedFd) -> Result<()> {
        match self.handoff.send_async(fd).await {
            Ok(()) => Ok(()),
            Err(flume::SendError(fd)) => {
                drop(fd);
                debug!(service = %self.name, "Registrant went away before handoff");
                Err(MuxError::reset("service is no longer registered"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn some_fd() -> OwnedFd {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        OwnedFd::from(a)
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = Registry::new();
        let reg = registry.insert(b"Foo").unwrap();
        assert_eq!(reg.name().as_str(), "foo");

        let handle = registry.lookup(b"FOO").unwrap();
        assert_eq!(handle.name().as_str(), "foo");
    }

    #[test]
    fn duplicate_insert_fails() {
        let registry = Registry::new();
        let _reg = registry.insert(b"echo").unwrap();
        assert!(matches!(
            registry.insert(b"ECHO"),
            Err(MuxError::AlreadyExists(name)) if name == "echo"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_name_is_never_inserted() {
        let registry = Registry::new();
        assert!(matches!(
            registry.insert(b"bad\x01name"),
            Err(MuxError::InvalidCharacter)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = Registry::new();
        assert!(matches!(
            registry.lookup(b"nope"),
            Err(MuxError::NotFound(_))
        ));
    }

    #[test]
    fn dropping_registration_removes_it() {
        let registry = Registry::new();
        let reg = registry.insert(b"svc").unwrap();
        drop(reg);
        assert!(registry.is_empty());
        assert!(registry.insert(b"svc").is_ok());
    }

    #[test]
    fn stale_remove_leaves_newer_registration() {
        let registry = Registry::new();
        let first = registry.insert(b"svc").unwrap();
        let stale_id = first.id();
        drop(first);

        let second = registry.insert(b"svc").unwrap();
        assert!(!registry.remove("svc", stale_id));
        assert_eq!(registry.names(), vec!["svc".to_string()]);
        drop(second);
    }

    #[test]
    fn concurrent_inserts_admit_exactly_one() {
        let registry = Registry::new();
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                let name = if i % 2 == 0 { "race" } else { "RACE" };
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.insert(name.as_bytes())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Err(MuxError::AlreadyExists(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(dup, 15);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_waits_for_the_consumer() {
        let registry = Registry::new();
        let reg = registry.insert(b"svc").unwrap();
        let handle = registry.lookup(b"svc").unwrap();

        let producer = tokio::spawn(async move { handle.dispatch(some_fd()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert!(reg.next_handoff().await.is_some());
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dispatch_to_departed_registrant_fails() {
        let registry = Registry::new();
        let reg = registry.insert(b"svc").unwrap();
        let handle = registry.lookup(b"svc").unwrap();
        drop(reg);

        assert!(matches!(
            handle.dispatch(some_fd()).await,
            Err(MuxError::ConnectionReset(_))
        ));
    }
}
