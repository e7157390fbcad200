//! UDP session table.
//!
//! Maps a local session key (the stringified local address) to the outbound
//! packet path that was dialed for it, plus a registry of per-key creation
//! locks so concurrent packets of a new session dial only once.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::adapter::PacketConn;
use crate::rules::Rule;

/// An established UDP session.
#[derive(Clone)]
pub struct Session {
    conn: Arc<dyn PacketConn>,
    rule: Option<Arc<dyn Rule>>,
    deadline: Arc<Mutex<Instant>>,
    idle: Duration,
}

impl Session {
    pub fn new(conn: Arc<dyn PacketConn>, rule: Option<Arc<dyn Rule>>, idle: Duration) -> Self {
        Self {
            conn,
            rule,
            deadline: Arc::new(Mutex::new(Instant::now() + idle)),
            idle,
        }
    }

    pub fn conn(&self) -> &Arc<dyn PacketConn> {
        &self.conn
    }

    /// Rule that selected the outbound, `None` for direct or global routing.
    pub fn rule(&self) -> Option<&Arc<dyn Rule>> {
        self.rule.as_ref()
    }

    /// Push the idle deadline out by one idle period from now.
    pub fn touch(&self) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now() + self.idle;
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.deadline, &other.deadline)
    }
}

/// Wait/notify primitive guarding the creation of one session.
///
/// Once broadcast it stays signalled, so a waiter that subscribes late
/// returns immediately.
pub struct SessionLock {
    done: watch::Sender<bool>,
}

impl SessionLock {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self { done }
    }

    /// Block until the creator calls [`SessionLock::broadcast`].
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn broadcast(&self) {
        self.done.send_replace(true);
    }
}

/// Session key to session map with single-flight creation locks.
#[derive(Default)]
pub struct NatTable {
    sessions: RwLock<FxHashMap<String, Session>>,
    locks: Mutex<FxHashMap<String, Arc<SessionLock>>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, session: Session) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), session);
    }

    pub fn delete(&self, key: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Remove `key` only while it still maps to `session`.
    ///
    /// Returns false when the entry was already replaced or removed.
    pub fn delete_session(&self, key: &str, session: &Session) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(key) {
            Some(current) if current.same(session) => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creation lock for `key`. `loaded` is true when another caller
    /// already owns it and the current caller should wait instead of dial.
    pub fn get_or_create_lock(&self, key: &str) -> (Arc<SessionLock>, bool) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(key) {
            return (lock.clone(), true);
        }
        let lock = Arc::new(SessionLock::new());
        locks.insert(key.to_string(), lock.clone());
        (lock, false)
    }

    pub fn delete_lock(&self, key: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn pending_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;

    use async_trait::async_trait;

    struct NullConn;

    #[async_trait]
    impl PacketConn for NullConn {
        async fn write_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            Ok(buf.len())
        }

        async fn read_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }
    }

    fn session() -> Session {
        Session::new(Arc::new(NullConn), None, Duration::from_secs(60))
    }

    #[test]
    fn set_get_delete() {
        let table = NatTable::new();
        assert!(table.get("127.0.0.1:5000").is_none());

        table.set("127.0.0.1:5000", session());
        assert!(table.get("127.0.0.1:5000").is_some());
        assert_eq!(table.len(), 1);

        table.delete("127.0.0.1:5000");
        assert!(table.is_empty());
    }

    #[test]
    fn delete_session_ignores_replaced_entry() {
        let table = NatTable::new();
        let old = session();
        table.set("k", old.clone());
        table.set("k", session());

        assert!(!table.delete_session("k", &old));
        assert!(table.get("k").is_some());

        let current = table.get("k").unwrap();
        assert!(table.delete_session("k", &current));
        assert!(table.get("k").is_none());
    }

    #[test]
    fn second_lock_request_is_loaded() {
        let table = NatTable::new();
        let (first, loaded) = table.get_or_create_lock("k");
        assert!(!loaded);

        let (second, loaded) = table.get_or_create_lock("k");
        assert!(loaded);
        assert!(Arc::ptr_eq(&first, &second));

        table.delete_lock("k");
        assert_eq!(table.pending_locks(), 0);
        let (_, loaded) = table.get_or_create_lock("k");
        assert!(!loaded);
    }

    #[tokio::test]
    async fn waiters_wake_on_broadcast() {
        let table = Arc::new(NatTable::new());
        let (lock, _) = table.get_or_create_lock("k");

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let (lock, loaded) = table.get_or_create_lock("k");
            assert!(loaded);
            waiters.push(tokio::spawn(async move { lock.wait().await }));
        }

        tokio::task::yield_now().await;
        lock.broadcast();
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn late_waiter_returns_immediately() {
        let table = NatTable::new();
        let (lock, _) = table.get_or_create_lock("k");
        lock.broadcast();

        tokio::time::timeout(Duration::from_secs(1), lock.wait())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_deadline() {
        let session = session();
        let first = session.deadline();

        tokio::time::advance(Duration::from_secs(10)).await;
        session.touch();

        assert_eq!(session.deadline() - first, Duration::from_secs(10));
    }
}
