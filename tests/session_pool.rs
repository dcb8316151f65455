use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sheaf::session::{Session, SessionFactory, SessionKind, SessionPool};
use sheaf::txn::CountedListener;
use sheaf::{Database, StoreConfig, TransactionListener};

struct CountingFactory {
    db: Arc<Database>,
    created: AtomicU64,
    next_id: AtomicU64,
}

impl SessionFactory for CountingFactory {
    fn create_session_async(
        &self,
        url: &str,
        callback: Box<dyn FnOnce(sheaf::Result<Arc<Session>>) + Send>,
    ) {
        self.created.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1000;
        let engine = self.db.engine().clone();
        let url = url.to_string();
        // Answer from another thread, the way a network reply would land.
        std::thread::spawn(move || {
            let session = Session::new(id, SessionKind::Client { url }, "localhost", engine);
            callback(Ok(session));
        });
    }
}

fn pool_with_factory(capacity: usize) -> (SessionPool, Arc<CountingFactory>, Arc<Database>) {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let factory = Arc::new(CountingFactory {
        db: Arc::clone(&db),
        created: AtomicU64::new(0),
        next_id: AtomicU64::new(0),
    });
    let pool = SessionPool::new(capacity, factory.clone());
    (pool, factory, db)
}

fn listener() -> Arc<dyn TransactionListener> {
    Arc::new(CountedListener::new())
}

#[test]
fn cache_miss_creates_then_hit_reuses() {
    let (pool, factory, db) = pool_with_factory(3);
    let listener = listener();

    let session = pool.get_session_sync("tcp://a:9610", &listener).unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    pool.release(Arc::clone(&session));
    assert_eq!(pool.idle_count("tcp://a:9610"), 1);

    let again = pool.get_session_sync("tcp://a:9610", &listener).unwrap();
    assert_eq!(again.id(), session.id());
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    db.close().unwrap();
}

#[test]
fn urls_have_independent_queues() {
    let (pool, factory, db) = pool_with_factory(3);
    let listener = listener();

    let a = pool.get_session_sync("tcp://a:9610", &listener).unwrap();
    let b = pool.get_session_sync("tcp://b:9610", &listener).unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.idle_count("tcp://a:9610"), 1);
    assert_eq!(pool.idle_count("tcp://b:9610"), 1);

    db.close().unwrap();
}

#[test]
fn full_queue_closes_the_released_session() {
    let (pool, _factory, db) = pool_with_factory(3);
    let listener = listener();

    let mut sessions = Vec::new();
    for _ in 0..4 {
        sessions.push(pool.get_session_sync("tcp://a:9610", &listener).unwrap());
    }
    let overflow = sessions.pop().unwrap();
    for session in sessions {
        pool.release(session);
    }
    assert_eq!(pool.idle_count("tcp://a:9610"), 3);

    pool.release(Arc::clone(&overflow));
    assert_eq!(pool.idle_count("tcp://a:9610"), 3);
    assert!(overflow.is_closed());

    db.close().unwrap();
}

#[test]
fn closed_sessions_are_not_handed_out() {
    let (pool, factory, db) = pool_with_factory(3);
    let listener = listener();

    let session = pool.get_session_sync("tcp://a:9610", &listener).unwrap();
    pool.release(Arc::clone(&session));
    session.close();

    let fresh = pool.get_session_sync("tcp://a:9610", &listener).unwrap();
    assert_ne!(fresh.id(), session.id());
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    db.close().unwrap();
}

#[test]
fn server_sessions_close_on_release() {
    let (pool, _factory, db) = pool_with_factory(3);
    let (session, _) = db.create_session(SessionKind::Server).unwrap();
    pool.release(Arc::clone(&session));
    assert!(session.is_closed());

    // Local sessions are simply not cached.
    let (local, _) = db.create_session(SessionKind::Local).unwrap();
    pool.release(Arc::clone(&local));
    assert!(!local.is_closed());

    db.close().unwrap();
}
