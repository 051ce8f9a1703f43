//! Credential status lines for the operator surface. Uses stored expiry
//! only; no network calls.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::store::{ChannelCredential, CredentialStore};
use crate::util::format_remaining;

fn describe(credential: &ChannelCredential, now: DateTime<Utc>) -> String {
    let lifetime = match credential.remaining(now) {
        None => "no expiry".to_string(),
        Some(left) if left.is_zero() => "EXPIRED".to_string(),
        Some(left) => format!("expires in {}", format_remaining(left)),
    };
    let refresh = if credential.refresh_token.is_some() {
        "auto-renew"
    } else {
        "manual renew"
    };
    format!("#{}: {lifetime}, {refresh}, v{}", credential.channel, credential.version)
}

/// One channel's status line.
pub fn describe_channel(store: &CredentialStore, channel: &str, now: DateTime<Utc>) -> Result<String> {
    Ok(match store.channel_credential(channel)? {
        Some(credential) => describe(&credential, now),
        None => format!("#{channel}: no owner token (redemptions unavailable)"),
    })
}

/// Evenly spaced indices covering `total` items with at most `sample` picks.
fn sample_indices(total: usize, sample: usize) -> Vec<usize> {
    if sample == 0 || total == 0 {
        return Vec::new();
    }
    if total <= sample {
        return (0..total).collect();
    }
    (0..sample).map(|i| i * total / sample).collect()
}

/// Summary over a bounded sample of the fleet's channel credentials.
pub fn fleet_sample(store: &CredentialStore, sample_size: usize, now: DateTime<Utc>) -> Result<String> {
    let channels = store.list_channels()?;
    if channels.is_empty() {
        return Ok("No channel tokens stored.".into());
    }

    let mut lines = Vec::new();
    let mut expired = 0;
    for index in sample_indices(channels.len(), sample_size) {
        if let Some(credential) = store.channel_credential(&channels[index])? {
            if credential.remaining(now).is_some_and(|left| left.is_zero()) {
                expired += 1;
            }
            lines.push(describe(&credential, now));
        }
    }

    Ok(format!(
        "{} channel tokens, sampled {} ({} expired): {}",
        channels.len(),
        lines.len(),
        expired,
        lines.join(" | ")
    ))
}
