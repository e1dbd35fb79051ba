//! Idempotency reservation: `SetNX(idem_key, submission_id, ttl)` so
//! a retried client request binds to the submission id the first request
//! already created, instead of enqueueing a duplicate judge run.

use std::time::Duration;

use crate::error::prelude::*;
use crate::kv::Cache;

fn idem_key(idempotency_key: &str) -> String {
    format!("submit-idem:{idempotency_key}")
}

/// Either this call won the race and `submission_id` is now bound to
/// `idempotency_key`, or someone else already holds it — in which case the
/// bound id is returned instead.
pub enum Reservation {
    Won,
    AlreadyBound(String),
}

pub async fn reserve(
    cache: &dyn Cache,
    idempotency_key: &str,
    submission_id: &str,
    ttl: Duration,
) -> Result<Reservation> {
    let key = idem_key(idempotency_key);
    if cache.set_nx(&key, submission_id, ttl).await? {
        return Ok(Reservation::Won);
    }
    match cache.get(&key).await? {
        Some(bound) => Ok(Reservation::AlreadyBound(bound)),
        // Lost the race to a reservation that expired between the failed
        // set_nx and this get; treat it as if we'd won rather than error out.
        None => Ok(Reservation::Won),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::inmemory::InMemoryCache;

    #[tokio::test]
    async fn first_caller_wins_the_reservation() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        match reserve(&cache, "idem-1", "sub-1", ttl).await.unwrap() {
            Reservation::Won => {}
            Reservation::AlreadyBound(_) => panic!("expected to win"),
        }
    }

    #[tokio::test]
    async fn second_caller_gets_the_bound_id() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        reserve(&cache, "idem-1", "sub-1", ttl).await.unwrap();
        match reserve(&cache, "idem-1", "sub-2", ttl).await.unwrap() {
            Reservation::AlreadyBound(id) => assert_eq!(id, "sub-1"),
            Reservation::Won => panic!("expected contention"),
        }
    }
}
