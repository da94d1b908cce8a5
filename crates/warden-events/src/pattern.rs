//! Channel pattern matching.
//!
//! Supported forms:
//! - exact: `agent.lifecycle`
//! - everything: `*`
//! - prefix: `agent.*` (anything under `agent.`)
//! - suffix: `*.error` (anything ending in `.error`)
//! - one-segment hole: `agent.*.status` (exactly one segment between)

/// Whether `channel` matches `pattern`.
#[must_use]
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        // `prefix.*` covers any channel with `prefix.` in front of it;
        // interior wildcards in the prefix still apply segment-wise.
        if let Some(rest) = channel.strip_prefix_segments(prefix) {
            return !rest.is_empty();
        }
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return channel.ends_with(&format!(".{suffix}"));
    }
    segments_match(pattern, channel)
}

fn segments_match(pattern: &str, channel: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let channel_segments: Vec<&str> = channel.split('.').collect();
    if pattern_segments.len() != channel_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(&channel_segments)
        .all(|(p, c)| *p == "*" || p == c)
}

/// Extension helper: strip a segment-wise matching prefix, returning
/// the remainder (including its leading dot stripped).
trait StripSegments {
    fn strip_prefix_segments(&self, prefix: &str) -> Option<&str>;
}

impl StripSegments for str {
    fn strip_prefix_segments(&self, prefix: &str) -> Option<&str> {
        let prefix_count = prefix.split('.').count();
        let mut dots = 0usize;
        for (idx, byte) in self.bytes().enumerate() {
            if byte == b'.' {
                dots = dots.saturating_add(1);
                if dots == prefix_count {
                    let head = &self[..idx];
                    if segments_match(prefix, head) {
                        return Some(&self[idx.saturating_add(1)..]);
                    }
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        assert!(channel_matches("agent.lifecycle", "agent.lifecycle"));
        assert!(!channel_matches("agent.lifecycle", "agent.tasks"));
    }

    #[test]
    fn test_star_matches_everything() {
        assert!(channel_matches("*", "agent.lifecycle"));
        assert!(channel_matches("*", "alerts"));
    }

    #[test]
    fn test_prefix_wildcard() {
        assert!(channel_matches("agent.*", "agent.lifecycle"));
        assert!(channel_matches("agent.*", "agent.lifecycle.deep"));
        assert!(!channel_matches("agent.*", "agent"));
        assert!(!channel_matches("agent.*", "other.lifecycle"));
    }

    #[test]
    fn test_suffix_wildcard() {
        assert!(channel_matches("*.error", "agent.error"));
        assert!(channel_matches("*.error", "cluster.node.error"));
        assert!(!channel_matches("*.error", "agent.errors"));
    }

    #[test]
    fn test_one_segment_hole() {
        assert!(channel_matches("agent.*.status", "agent.a1.status"));
        assert!(!channel_matches("agent.*.status", "agent.a1.b2.status"));
        assert!(!channel_matches("agent.*.status", "agent.status"));
    }
}
