//! Small shared helpers: timestamps, nonce generation, CDN URL hashing.

use rand::Rng;

/// Discord epoch (first second of 2015) in milliseconds.
const DISCORD_EPOCH: u64 = 1_420_070_400_000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a snowflake-style nonce for interaction correlation.
///
/// The timestamp occupies the upper bits like a real Discord snowflake;
/// the low 22 bits are randomized so two dispatches within the same
/// millisecond still get distinct nonces.
pub fn generate_nonce() -> String {
    let ts = now_ms().saturating_sub(DISCORD_EPOCH);
    let low: u64 = rand::thread_rng().gen_range(0..(1u64 << 22));
    ((ts << 22) | low).to_string()
}

/// Extract the job hash from a Midjourney CDN image URL.
///
/// Grid previews end in `<hash>_grid_0.webp`; finished renders end in
/// `<name>_<hash>.<ext>` where the hash is the last `_`-separated segment
/// of the file stem.
pub fn message_hash(image_url: &str) -> Option<String> {
    let file = image_url.rsplit('/').next()?;
    let file = file.split('?').next().unwrap_or(file);
    if let Some(stripped) = file.strip_suffix("_grid_0.webp") {
        return Some(stripped.to_string());
    }
    let stem = match file.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => return None,
    };
    stem.rsplit('_').next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_numeric_and_unique() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert!(a.parse::<u64>().is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn hash_from_finished_render() {
        let url = "https://cdn.discordapp.com/attachments/1/2/user_cat_0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9.png";
        assert_eq!(
            message_hash(url).as_deref(),
            Some("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9")
        );
    }

    #[test]
    fn hash_from_grid_preview() {
        let url = "https://cdn.midjourney.com/0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9_grid_0.webp";
        assert_eq!(
            message_hash(url).as_deref(),
            Some("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9")
        );
    }

    #[test]
    fn hash_ignores_query_string() {
        let url = "https://cdn.discordapp.com/attachments/1/2/a_b_deadbeef.png?ex=1&is=2";
        assert_eq!(message_hash(url).as_deref(), Some("deadbeef"));
    }

    #[test]
    fn hash_missing_extension() {
        assert_eq!(message_hash("https://example.com/no-extension"), None);
    }
}
