//! Shared key and channel naming.
//!
//! Key format: `b_{id}_{suffix}` for each of [`KEY_SUFFIXES`]. Channels are
//! `b_{id}` for the whole limiter and `b_{id}_{client}` for one process.

/// Suffixes of every key a limiter owns, settings first.
pub const KEY_SUFFIXES: [&str; 8] = [
    "settings",
    "job_weights",
    "job_expirations",
    "job_clients",
    "client_running",
    "client_num_queued",
    "client_last_registered",
    "client_last_seen",
];

pub fn key(id: &str, suffix: &str) -> String {
    format!("b_{}_{}", id, suffix)
}

pub fn settings_key(id: &str) -> String {
    key(id, KEY_SUFFIXES[0])
}

/// Every key owned by limiter `id`.
pub fn all_keys(id: &str) -> Vec<String> {
    KEY_SUFFIXES.iter().map(|suffix| key(id, suffix)).collect()
}

pub fn channel(id: &str) -> String {
    format!("b_{}", id)
}

pub fn client_channel(id: &str, client: &str) -> String {
    format!("b_{}_{}", id, client)
}

/// Id of the limiter a group creates for `key`.
pub fn group_limiter_id(group_id: &str, key: &str) -> String {
    format!("{}-{}", group_id, key)
}

/// Scan pattern matching the settings key of every limiter in a group.
pub fn group_settings_pattern(group_id: &str) -> String {
    format!("b_{}-*_settings", group_id)
}

/// Recovers the group key from a settings key matched by
/// [`group_settings_pattern`].
pub fn group_key_from_settings_key<'a>(group_id: &str, settings_key: &'a str) -> Option<&'a str> {
    settings_key
        .strip_prefix("b_")?
        .strip_prefix(group_id)?
        .strip_prefix('-')?
        .strip_suffix("_settings")
}

/// Glob matching with `*` (any run) and `?` (any single character).
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|ch| *ch == '*')
}
