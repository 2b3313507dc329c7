//! Environment parsing helpers shared by `from_env` config constructors.
//!
//! Every helper treats missing, blank, unparsable, and (for the `positive`
//! variants) zero values as absent so callers fall back to their defaults.

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads a strictly positive integer from `name`.
pub fn env_positive_u64(name: &str) -> Option<u64> {
    env_trimmed(name)
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

/// Reads a strictly positive `usize` from `name`.
pub fn env_positive_usize(name: &str) -> Option<usize> {
    env_positive_u64(name).and_then(|value| usize::try_from(value).ok())
}

/// Reads a boolean toggle (`1|true|yes|on` / `0|false|no|off`).
pub fn env_flag(name: &str) -> Option<bool> {
    let normalized = env_trimmed(name)?.to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
