//! Ambient correlation ID propagation.
//!
//! A logical request keeps one correlation ID across every hop: RPC
//! calls, async calls, events, HTTP and WebSockets. The ID is held in a
//! task-local so handler bodies and their sub-calls pick it up without
//! explicit plumbing. Inbound dispatch installs the envelope's ID for
//! the duration of the handler; outbound paths read it back.

use std::future::Future;
use std::sync::LazyLock;

use uuid::Uuid;

/// Courier UUID namespace derived from DNS-based UUIDv5.
///
/// Used for deterministic UUID generation (e.g., service name to stable ID).
pub static COURIER_UUID_NAMESPACE: LazyLock<Uuid> =
    LazyLock::new(|| Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"courier.dev"));

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Mint a fresh correlation ID: UUIDv4 as lowercase hex, no dashes.
pub fn mint() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Correlation ID of the current task, if one is installed.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Correlation ID of the current task, minting a new one if absent.
pub fn current_or_mint() -> String {
    current().unwrap_or_else(mint)
}

/// Run a future with the given correlation ID installed.
///
/// Sub-tasks spawned inside do not inherit the task-local; dispatch code
/// re-installs the ID on every spawned handler task.
pub async fn with_correlation<F>(id: String, fut: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(id, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_is_simple_hex() {
        let id = mint();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_mint_is_unique() {
        assert_ne!(mint(), mint());
    }

    #[tokio::test]
    async fn test_current_outside_scope_is_none() {
        assert!(current().is_none());
        assert_eq!(current_or_mint().len(), 32);
    }

    #[tokio::test]
    async fn test_with_correlation_installs_id() {
        let id = mint();
        let seen = with_correlation(id.clone(), async { current() }).await;
        assert_eq!(seen, Some(id));
    }

    #[tokio::test]
    async fn test_nested_scope_shadows_outer() {
        let outer = mint();
        let inner = mint();
        let (seen_inner, seen_outer) = with_correlation(outer.clone(), async {
            let seen_inner = with_correlation(inner.clone(), async { current() }).await;
            (seen_inner, current())
        })
        .await;
        assert_eq!(seen_inner, Some(inner));
        assert_eq!(seen_outer, Some(outer));
    }
}
