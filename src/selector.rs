//! Session-aware account selection. Produces an ordered candidate list:
//! best first, the rest as failover. Pure over its inputs; the one side
//! effect (restarting an expired session window) is returned as a request
//! for the dispatcher to apply through the store.

use uuid::Uuid;

use crate::accounts::Account;

/// Request metadata the strategy looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMeta {
    /// Suppresses the sticky-session step (set via the bypass header).
    /// The session-reset side effect stays enabled.
    pub bypass_sticky: bool,
}

#[derive(Debug)]
pub struct Selection {
    /// Candidates in try-order. Rate-limited (but unpaused) accounts trail
    /// the list as a last resort; paused accounts never appear.
    pub candidates: Vec<Account>,
    /// Account whose session window must be restarted before use.
    pub reset_session: Option<Uuid>,
}

impl Selection {
    fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            reset_session: None,
        }
    }
}

pub fn select(
    accounts: &[Account],
    meta: &RequestMeta,
    now: u64,
    session_duration_ms: u64,
) -> Selection {
    let available: Vec<&Account> = accounts.iter().filter(|a| a.is_available(now)).collect();
    // Rate-limited accounts trail the candidate list, soonest reset first,
    // so a request only reaches them after every healthy account failed.
    let mut limited: Vec<&Account> = accounts
        .iter()
        .filter(|a| !a.paused && !a.is_available(now))
        .collect();
    limited.sort_by_key(|a| a.rate_limited_until.unwrap_or(u64::MAX));

    if available.is_empty() && limited.is_empty() {
        return Selection::empty();
    }

    // 1. Auto-fallback: a higher-priority account whose provider window has
    //    reset reclaims traffic from lower-priority siblings.
    let mut fallback: Vec<&Account> = available
        .iter()
        .copied()
        .filter(|a| {
            a.auto_fallback_enabled && a.rate_limit_reset.is_some_and(|reset| reset <= now)
        })
        .collect();
    if !fallback.is_empty() {
        fallback.sort_by_key(|a| a.priority);
        let rest = by_priority_excluding(&available, &fallback);
        return finish(fallback.into_iter().chain(rest).collect(), &limited, now, session_duration_ms);
    }

    // 2. Sticky session: prefer the account with the most recent live
    //    session window. A rate-limited or paused holder falls through.
    if !meta.bypass_sticky
        && let Some(sticky) = available
            .iter()
            .copied()
            .filter(|a| {
                a.provider.tracks_session() && !a.session_expired(now, session_duration_ms)
            })
            .max_by_key(|a| a.session_start.unwrap_or(0))
    {
        let rest = by_priority_excluding(&available, &[sticky]);
        return finish(
            std::iter::once(sticky).chain(rest).collect(),
            &limited,
            now,
            session_duration_ms,
        );
    }

    // 3. Fresh selection by priority.
    let mut ordered = available.clone();
    ordered.sort_by_key(|a| a.priority);
    finish(ordered, &limited, now, session_duration_ms)
}

/// Remaining available accounts sorted ascending by priority (stable: equal
/// priorities keep input order).
fn by_priority_excluding<'a>(available: &[&'a Account], head: &[&Account]) -> Vec<&'a Account> {
    let mut rest: Vec<&Account> = available
        .iter()
        .copied()
        .filter(|a| !head.iter().any(|h| h.id == a.id))
        .collect();
    rest.sort_by_key(|a| a.priority);
    rest
}

fn finish(
    ordered: Vec<&Account>,
    limited: &[&Account],
    now: u64,
    session_duration_ms: u64,
) -> Selection {
    let reset_session = ordered
        .first()
        .filter(|a| a.provider.tracks_session() && a.session_expired(now, session_duration_ms))
        .map(|a| a.id);

    Selection {
        candidates: ordered
            .into_iter()
            .chain(limited.iter().copied())
            .cloned()
            .collect(),
        reset_session,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{ProviderKind, test_account};

    const HOUR: u64 = 60 * 60 * 1000;
    const SESSION: u64 = 5 * HOUR;
    const NOW: u64 = 100_000_000;

    fn names(sel: &Selection) -> Vec<&str> {
        sel.candidates.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn test_empty_pool() {
        let sel = select(&[], &RequestMeta::default(), NOW, SESSION);
        assert!(sel.candidates.is_empty());
        assert!(sel.reset_session.is_none());
    }

    #[test]
    fn test_all_paused_returns_empty() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.paused = true;
        let sel = select(&[a], &RequestMeta::default(), NOW, SESSION);
        assert!(sel.candidates.is_empty());
    }

    #[test]
    fn test_priority_ordering_with_rate_limited_tail() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 0;
        a.rate_limited_until = Some(NOW + 60_000);
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;

        let sel = select(&[a, b], &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&sel), vec!["b", "a"]);
    }

    #[test]
    fn test_sticky_session_preferred_over_priority() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 0;
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;
        b.session_start = Some(NOW - HOUR);

        let sel = select(&[a, b], &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&sel), vec!["b", "a"]);
        assert!(sel.reset_session.is_none());
    }

    #[test]
    fn test_expired_session_falls_back_to_priority_and_resets() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 0;
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;
        b.session_start = Some(NOW - SESSION - 1);

        let sel = select(&[a.clone(), b], &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&sel), vec!["a", "b"]);
        // The fresh pick is session-tracking with no live window
        assert_eq!(sel.reset_session, Some(a.id));
    }

    #[test]
    fn test_auto_fallback_reclaims_from_sticky_session() {
        // Scenario: A's provider window reset is in the past, B holds a live
        // sticky session. A reclaims the traffic.
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 0;
        a.auto_fallback_enabled = true;
        a.rate_limit_reset = Some(999_000);
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;
        b.session_start = Some(999_500);

        let sel = select(&[a, b], &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&sel), vec!["a", "b"]);
    }

    #[test]
    fn test_auto_fallback_requires_elapsed_reset() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 0;
        a.auto_fallback_enabled = true;
        a.rate_limit_reset = Some(NOW + 1);
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;
        b.session_start = Some(NOW - HOUR);

        // Window not yet reset: sticky session holds.
        let sel = select(&[a, b], &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&sel), vec!["b", "a"]);
    }

    #[test]
    fn test_rate_limited_sticky_holder_falls_through() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 0;
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;
        b.session_start = Some(NOW - HOUR);
        b.rate_limited_until = Some(NOW + 60_000);

        let sel = select(&[a.clone(), b], &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&sel), vec!["a", "b"]);
        assert_eq!(sel.reset_session, Some(a.id));
    }

    #[test]
    fn test_bypass_suppresses_sticky_but_not_reset() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 0;
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;
        b.session_start = Some(NOW - HOUR);

        let meta = RequestMeta {
            bypass_sticky: true,
        };
        let sel = select(&[a.clone(), b], &meta, NOW, SESSION);
        assert_eq!(names(&sel), vec!["a", "b"]);
        // Fresh pick has no live session, so the reset side effect fires.
        assert_eq!(sel.reset_session, Some(a.id));
    }

    #[test]
    fn test_equal_priorities_keep_input_order() {
        let a = test_account("a", ProviderKind::AnthropicConsoleKey);
        let b = test_account("b", ProviderKind::AnthropicConsoleKey);
        let c = test_account("c", ProviderKind::AnthropicConsoleKey);

        let sel = select(
            &[a.clone(), b.clone(), c.clone()],
            &RequestMeta::default(),
            NOW,
            SESSION,
        );
        assert_eq!(names(&sel), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_selection_is_idempotent_without_state_change() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.priority = 2;
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.priority = 1;
        b.session_start = Some(NOW - HOUR);
        let pool = [a, b];

        let first = select(&pool, &RequestMeta::default(), NOW, SESSION);
        let second = select(&pool, &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&first), names(&second));
        assert_eq!(first.reset_session, second.reset_session);
    }

    #[test]
    fn test_most_recent_session_wins_among_several() {
        let mut a = test_account("a", ProviderKind::AnthropicOauth);
        a.session_start = Some(NOW - 2 * HOUR);
        let mut b = test_account("b", ProviderKind::AnthropicOauth);
        b.session_start = Some(NOW - HOUR);

        let sel = select(&[a, b], &RequestMeta::default(), NOW, SESSION);
        assert_eq!(names(&sel)[0], "b");
    }
}
