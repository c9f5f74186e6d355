//! Per-connection epoch arithmetic (spec §3): the only ordering primitive
//! across instances, used to fence a stale socket from overwriting a
//! reconnected one.

/// The epoch a `join` assigns a connection: `now` if there is no prior
/// record, otherwise `max(prior + 1, now)` so a rapid reconnect still
/// strictly advances past the old epoch even when clocks don't move.
pub fn next_join_epoch(prior: Option<i64>, now_ms: u64) -> i64 {
    let now = now_ms as i64;
    match prior {
        Some(p) => (p + 1).max(now),
        None => now,
    }
}

/// Outcome of comparing a heartbeat's requested epoch against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochDecision {
    /// No epoch was requested; the stored epoch is unchanged.
    Unchanged,
    /// The requested epoch strictly exceeds the stored one; it becomes new.
    Advance(i64),
    /// The requested epoch is strictly less than stored; reject as stale.
    Stale,
}

pub fn decide_heartbeat_epoch(stored: i64, requested: Option<i64>) -> EpochDecision {
    match requested {
        None => EpochDecision::Unchanged,
        Some(r) if r < stored => EpochDecision::Stale,
        Some(r) if r > stored => EpochDecision::Advance(r),
        Some(_) => EpochDecision::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_with_no_prior_uses_now() {
        assert_eq!(next_join_epoch(None, 1000), 1000);
    }

    #[test]
    fn join_with_prior_advances_past_it() {
        // Reconnect happening "instantly" (now hasn't moved): epoch still +1.
        assert_eq!(next_join_epoch(Some(1000), 1000), 1001);
    }

    #[test]
    fn join_with_prior_and_elapsed_time_uses_now() {
        assert_eq!(next_join_epoch(Some(1000), 5000), 5000);
    }

    #[test]
    fn heartbeat_epoch_equal_is_unchanged() {
        assert_eq!(decide_heartbeat_epoch(5, Some(5)), EpochDecision::Unchanged);
    }

    #[test]
    fn heartbeat_epoch_lower_is_stale() {
        assert_eq!(decide_heartbeat_epoch(5, Some(4)), EpochDecision::Stale);
    }

    #[test]
    fn heartbeat_epoch_higher_advances() {
        assert_eq!(decide_heartbeat_epoch(5, Some(6)), EpochDecision::Advance(6));
    }

    #[test]
    fn heartbeat_epoch_absent_is_unchanged() {
        assert_eq!(decide_heartbeat_epoch(5, None), EpochDecision::Unchanged);
    }
}
