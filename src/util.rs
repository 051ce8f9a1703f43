//! Small helpers shared across the control plane.

use std::time::Duration;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Works on character boundaries so multi-byte UTF-8 input never panics.
/// Used to keep remote error bodies and chat replies to a readable size.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Canonical form of a channel name: trimmed, lowercase, without a leading `#`.
pub fn normalize_channel(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_ascii_lowercase()
}

/// Render a remaining lifetime as a coarse human-readable string
/// (`"3d 4h"`, `"5h 12m"`, `"42m"`, `"expired"`).
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    if secs == 0 {
        return "expired".into();
    }
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_strings_alone() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn truncate_cuts_on_char_boundary() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("héllo wörld", 7), "héllo w...");
    }

    #[test]
    fn normalize_channel_strips_hash_and_case() {
        assert_eq!(normalize_channel("  #Alice "), "alice");
        assert_eq!(normalize_channel("bob_42"), "bob_42");
    }

    #[test]
    fn format_remaining_picks_largest_units() {
        assert_eq!(format_remaining(Duration::from_secs(0)), "expired");
        assert_eq!(format_remaining(Duration::from_secs(42)), "42s");
        assert_eq!(format_remaining(Duration::from_secs(42 * 60)), "42m");
        assert_eq!(format_remaining(Duration::from_secs(5 * 3600 + 12 * 60)), "5h 12m");
        assert_eq!(format_remaining(Duration::from_secs(3 * 86_400 + 4 * 3600)), "3d 4h");
    }
}
