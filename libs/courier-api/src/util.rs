/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Whether a message created at `created_at_ms` with the given TTL has
/// outlived it at `now_ms`. A zero TTL never expires, and neither does one
/// whose deadline does not fit in an `i64`.
pub fn is_overdue(created_at_ms: i64, time_to_live_ms: u64, now_ms: i64) -> bool {
    if time_to_live_ms == 0 {
        return false;
    }
    i64::try_from(time_to_live_ms)
        .ok()
        .and_then(|ttl| created_at_ms.checked_add(ttl))
        .is_some_and(|deadline| deadline <= now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_never_overdue() {
        assert!(!is_overdue(0, 0, i64::MAX));
    }

    #[test]
    fn overdue_once_deadline_reached() {
        assert!(!is_overdue(1_000, 500, 1_499));
        assert!(is_overdue(1_000, 500, 1_500));
    }

    #[test]
    fn unrepresentable_deadline_never_overdue() {
        assert!(!is_overdue(1_000, u64::MAX, i64::MAX));
        assert!(!is_overdue(1_000, i64::MAX as u64, i64::MAX));
    }
}
