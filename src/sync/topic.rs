//! Dot-hierarchical topic and path matching shared by the bus, the state
//! store and the WebSocket connection registry.
//!
//! Patterns:
//! - `*` matches everything
//! - `a.b.*` matches every descendant of `a.b` (not `a.b` itself)
//! - anything else matches exactly

pub const WILDCARD: &str = "*";

pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }

    match pattern.strip_suffix(".*") {
        Some(prefix) => topic.len() > prefix.len() + 1
            && topic.starts_with(prefix)
            && topic.as_bytes()[prefix.len()] == b'.',
        None => pattern == topic,
    }
}

/// True if any pattern in `patterns` matches `topic`
pub fn matches_any<S: AsRef<str>>(patterns: &[S], topic: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_and_exact() {
        assert!(matches("*", "signal.created"));
        assert!(matches("signal.created", "signal.created"));
        assert!(!matches("signal.created", "signal.confirmed"));
    }

    #[test]
    fn test_prefix() {
        assert!(matches("signal.*", "signal.created"));
        assert!(matches("state.*", "state.trading.pnl"));
        assert!(!matches("signal.*", "signal"));
        assert!(!matches("signal.*", "signals.created"));
        assert!(!matches("state.trading.*", "state.tradingx.pnl"));
    }

    #[test]
    fn test_matches_any() {
        let patterns = vec!["orders.*".to_string(), "signal.missed".to_string()];
        assert!(matches_any(&patterns, "orders.placed"));
        assert!(matches_any(&patterns, "signal.missed"));
        assert!(!matches_any(&patterns, "signal.created"));
    }
}
