use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Opaque credential identifying a mutex holder and authorizing
/// `force_cleanup` from a socket.
#[derive(Debug, Clone, Eq, PartialEq, Hash, derive_more::Display)]
pub struct ConnectionToken(String);

impl ConnectionToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
struct Claim {
    holder: ConnectionToken,
    claimed_at: Instant,
}

/// Single-holder claim on the BLE radio.
///
/// This is not a thread fence; it is a resource claim that survives across
/// tasks. A holder that stops refreshing goes stale and can be displaced,
/// which recovers from crashed holders that never released. There is no
/// queueing: contention surfaces to clients as a busy error.
pub struct ConnectionMutex {
    claim: Mutex<Option<Claim>>,
    stale_after: Duration,
}

impl ConnectionMutex {
    #[must_use]
    pub fn new(stale_after: Duration) -> Self {
        Self {
            claim: Mutex::new(None),
            stale_after,
        }
    }

    /// Claims the radio if unheld, or if the current claim has gone stale.
    #[must_use]
    pub fn try_claim(&self, token: &ConnectionToken) -> bool {
        let mut claim = self.claim.lock().expect("connection mutex lock poisoned");
        let takeable = match claim.as_ref() {
            None => true,
            Some(existing) => existing.claimed_at.elapsed() > self.stale_after,
        };
        if takeable {
            *claim = Some(Claim {
                holder: token.clone(),
                claimed_at: Instant::now(),
            });
        }
        takeable
    }

    /// Resets the staleness clock while the holder is demonstrably alive.
    pub fn refresh(&self, token: &ConnectionToken) {
        let mut claim = self.claim.lock().expect("connection mutex lock poisoned");
        if let Some(existing) = claim.as_mut()
            && existing.holder == *token
        {
            existing.claimed_at = Instant::now();
        }
    }

    /// Releases only when `token` is the current holder.
    pub fn release(&self, token: &ConnectionToken) -> bool {
        let mut claim = self.claim.lock().expect("connection mutex lock poisoned");
        match claim.as_ref() {
            Some(existing) if existing.holder == *token => {
                *claim = None;
                true
            }
            _ => false,
        }
    }

    /// Unconditional release, used during zombie cleanup and shutdown.
    pub fn force_release(&self) {
        *self.claim.lock().expect("connection mutex lock poisoned") = None;
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.claim
            .lock()
            .expect("connection mutex lock poisoned")
            .is_none()
    }

    /// True when `token` currently holds the claim.
    #[must_use]
    pub fn held_by(&self, token: &ConnectionToken) -> bool {
        self.claim
            .lock()
            .expect("connection mutex lock poisoned")
            .as_ref()
            .is_some_and(|claim| claim.holder == *token)
    }

    /// True when a claim exists and has exceeded the stale deadline.
    #[must_use]
    pub fn holder_is_stale(&self) -> bool {
        self.claim
            .lock()
            .expect("connection mutex lock poisoned")
            .as_ref()
            .is_some_and(|claim| claim.claimed_at.elapsed() > self.stale_after)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{Duration, advance};

    use super::*;

    fn mutex() -> ConnectionMutex {
        ConnectionMutex::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn claim_release_claim_succeeds_with_no_intervening_holder() {
        let mutex = mutex();
        let token = ConnectionToken::generate();

        assert!(mutex.try_claim(&token));
        assert!(mutex.release(&token));
        assert!(mutex.is_free());
        assert!(mutex.try_claim(&token));
    }

    #[tokio::test]
    async fn second_holder_is_rejected_while_claim_is_fresh() {
        let mutex = mutex();
        let first = ConnectionToken::generate();
        let second = ConnectionToken::generate();

        assert!(mutex.try_claim(&first));
        assert!(!mutex.try_claim(&second));
        assert!(mutex.held_by(&first));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_claim_can_be_displaced() {
        let mutex = mutex();
        let crashed = ConnectionToken::generate();
        let newcomer = ConnectionToken::generate();

        assert!(mutex.try_claim(&crashed));
        advance(Duration::from_secs(31)).await;
        assert!(mutex.holder_is_stale());
        assert!(mutex.try_claim(&newcomer));
        assert!(mutex.held_by(&newcomer));
        assert!(!mutex.holder_is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_the_claim_fresh() {
        let mutex = mutex();
        let holder = ConnectionToken::generate();
        let rival = ConnectionToken::generate();

        assert!(mutex.try_claim(&holder));
        advance(Duration::from_secs(20)).await;
        mutex.refresh(&holder);
        advance(Duration::from_secs(20)).await;
        assert!(!mutex.try_claim(&rival));
    }

    #[tokio::test]
    async fn release_by_non_holder_is_rejected() {
        let mutex = mutex();
        let holder = ConnectionToken::generate();
        let rival = ConnectionToken::generate();

        assert!(mutex.try_claim(&holder));
        assert!(!mutex.release(&rival));
        assert!(mutex.held_by(&holder));
    }

    #[tokio::test]
    async fn force_release_is_unconditional() {
        let mutex = mutex();
        let holder = ConnectionToken::generate();

        assert!(mutex.try_claim(&holder));
        mutex.force_release();
        assert!(mutex.is_free());
    }
}
