//! Per-request session identities
//!
//! A session is an opaque identity token handed to the user handler
//! alongside each request; a fetcher layered on top of the engine
//! typically binds cookies or proxy credentials to it. The engine
//! itself only rotates sessions, marks them good or bad after each
//! attempt, and retires the ones that have soaked up too many errors
//! or too much use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

/// How much one `mark_good` call repairs the error score.
const ERROR_SCORE_DECREMENT: f64 = 0.5;

/// Tuning options for a [`SessionPool`].
#[derive(Debug, Clone)]
pub struct SessionPoolOptions {
    /// Maximum number of live sessions kept at once.
    pub max_pool_size: usize,
    /// A session is retired after being handed out this many times.
    pub max_usage_count: u64,
    /// A session is retired once its error score reaches this value.
    pub max_error_score: f64,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            max_usage_count: 50,
            max_error_score: 3.0,
        }
    }
}

/// A single rotating identity. Cheap to clone via [`SessionHandle`];
/// all state is interior so the crawler, the handler, and the pool can
/// share one instance.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    usage_count: AtomicU64,
    error_score: Mutex<f64>,
    retired: AtomicBool,
    max_usage_count: u64,
    max_error_score: f64,
}

/// Shared reference to a [`Session`].
pub type SessionHandle = Arc<Session>;

impl Session {
    fn new(options: &SessionPoolOptions) -> Self {
        Self {
            id: format!("session_{}", Uuid::new_v4().simple()),
            created_at: Instant::now(),
            usage_count: AtomicU64::new(0),
            error_score: Mutex::new(0.0),
            retired: AtomicBool::new(false),
            max_usage_count: options.max_usage_count,
            max_error_score: options.max_error_score,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn error_score(&self) -> f64 {
        *self.error_score.lock()
    }

    /// Whether the session may still be handed out.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.retired.load(Ordering::Relaxed)
            && self.usage_count() < self.max_usage_count
            && self.error_score() < self.max_error_score
    }

    /// Record a successful attempt; partially repairs the error score.
    pub fn mark_good(&self) {
        let mut score = self.error_score.lock();
        *score = (*score - ERROR_SCORE_DECREMENT).max(0.0);
    }

    /// Record a failed attempt; the session is retired once the score
    /// reaches the configured maximum.
    pub fn mark_bad(&self) {
        let mut score = self.error_score.lock();
        *score += 1.0;
        if *score >= self.max_error_score {
            debug!("Session {} exceeded error score, retiring", self.id);
            self.retired.store(true, Ordering::Relaxed);
        }
    }

    /// Remove the session from rotation immediately.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Relaxed);
    }

    fn bump_usage(&self) {
        self.usage_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Rotating pool of [`Session`]s.
#[derive(Debug)]
pub struct SessionPool {
    options: SessionPoolOptions,
    sessions: Mutex<Vec<SessionHandle>>,
}

impl SessionPool {
    #[must_use]
    pub fn new(options: SessionPoolOptions) -> Self {
        Self {
            options,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Hand out a usable session, creating one when the pool is not yet
    /// full and picking a random live one otherwise.
    pub fn session(&self) -> SessionHandle {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.is_usable());

        let session = if sessions.is_empty() || sessions.len() < self.options.max_pool_size {
            let session: SessionHandle = Arc::new(Session::new(&self.options));
            sessions.push(Arc::clone(&session));
            session
        } else {
            let index = rand::rng().random_range(0..sessions.len());
            Arc::clone(&sessions[index])
        };

        session.bump_usage();
        session
    }

    /// Number of live (usable) sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.is_usable());
        sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new(SessionPoolOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_sessions_up_to_pool_size() {
        let pool = SessionPool::new(SessionPoolOptions {
            max_pool_size: 2,
            ..SessionPoolOptions::default()
        });
        let a = pool.session();
        let b = pool.session();
        assert_eq!(pool.len(), 2);

        // Pool is full: the third handle reuses a live session.
        let c = pool.session();
        assert!(c.id() == a.id() || c.id() == b.id());
    }

    #[test]
    fn retires_after_repeated_failures() {
        let pool = SessionPool::new(SessionPoolOptions {
            max_pool_size: 1,
            max_error_score: 2.0,
            ..SessionPoolOptions::default()
        });
        let session = pool.session();
        session.mark_bad();
        assert!(session.is_usable());
        session.mark_bad();
        assert!(!session.is_usable());
        assert!(pool.is_empty());

        // The next retrieval rotates in a fresh session.
        let fresh = pool.session();
        assert_ne!(fresh.id(), session.id());
    }

    #[test]
    fn mark_good_repairs_error_score() {
        let pool = SessionPool::default();
        let session = pool.session();
        session.mark_bad();
        session.mark_good();
        session.mark_good();
        assert_eq!(session.error_score(), 0.0);
    }

    #[test]
    fn usage_count_retires_sessions() {
        let pool = SessionPool::new(SessionPoolOptions {
            max_pool_size: 1,
            max_usage_count: 2,
            ..SessionPoolOptions::default()
        });
        let first = pool.session();
        let second = pool.session();
        assert_eq!(first.id(), second.id());
        // Used twice: worn out, replaced on the next retrieval.
        let third = pool.session();
        assert_ne!(third.id(), first.id());
    }
}
