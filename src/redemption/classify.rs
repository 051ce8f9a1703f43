/// Reward-title fragments that mark a redemption as a timeout request.
pub const TIMEOUT_KEYWORDS: [&str; 6] = ["timeout", "time out", "ban", "silence", "mute", "penalty"];

/// Case-insensitive substring match of the reward title against
/// [`TIMEOUT_KEYWORDS`].
pub fn is_timeout_redemption(title: &str) -> bool {
    let lower = title.to_lowercase();
    TIMEOUT_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// First token of the viewer's free text as a login: `@` stripped,
/// lowercased. Grammar validation is left to the caller.
pub fn sanitize_target(input: &str) -> Option<String> {
    let token = input.split_whitespace().next()?;
    let login = token.trim_start_matches('@').trim_end_matches([',', '.', '!', '?']);
    (!login.is_empty()).then(|| login.to_lowercase())
}
