use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Receivers of every `/sendbatch` message. Fixed at build time.
pub const RECIPIENTS: &[&str] = &["919902025067"];

/// Typed configuration for the relay.
#[derive(Clone, Debug)]
pub struct Config {
    // Session
    pub auth_dir: PathBuf,
    pub bridge_path: PathBuf,
    pub bridge_args: Vec<String>,
    pub send_timeout: Duration,

    // Reconnect policy
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// `0` means keep trying forever.
    pub reconnect_max_attempts: u32,

    // Batch
    pub recipients: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let auth_dir =
            env_path("WAB_AUTH_DIR").unwrap_or_else(|| PathBuf::from("auth_info_baileys"));
        if auth_dir.as_os_str().is_empty() {
            return Err(Error::Config("WAB_AUTH_DIR must not be empty".to_string()));
        }

        let bridge_path = env_path("WAB_BRIDGE_PATH")
            .or_else(|| which_in_path("wa-bridge"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/wa-bridge"));
        let bridge_args = env_str("WAB_BRIDGE_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let send_timeout =
            Duration::from_millis(env_u64("WAB_SEND_TIMEOUT_MS").unwrap_or(30_000));

        let reconnect_initial_delay =
            Duration::from_millis(env_u64("WAB_RECONNECT_INITIAL_MS").unwrap_or(2_000));
        let reconnect_max_delay =
            Duration::from_millis(env_u64("WAB_RECONNECT_MAX_MS").unwrap_or(60_000));
        if reconnect_max_delay < reconnect_initial_delay {
            return Err(Error::Config(
                "WAB_RECONNECT_MAX_MS must be >= WAB_RECONNECT_INITIAL_MS".to_string(),
            ));
        }
        let reconnect_max_attempts = env_u32("WAB_RECONNECT_MAX_ATTEMPTS").unwrap_or(0);

        Ok(Self {
            auth_dir,
            bridge_path,
            bridge_args,
            send_timeout,
            reconnect_initial_delay,
            reconnect_max_delay,
            reconnect_max_attempts,
            recipients: RECIPIENTS.iter().map(|s| s.to_string()).collect(),
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_parsing_skips_comments_and_strips_quotes() {
        let parsed = parse_dotenv(
            "# comment\n\nWAB_AUTH_DIR=\"/var/lib/wab\"\nWAB_BRIDGE_ARGS='--foo bar'\nnoequals\n=novalue\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("WAB_AUTH_DIR".to_string(), "/var/lib/wab".to_string()),
                ("WAB_BRIDGE_ARGS".to_string(), "--foo bar".to_string()),
            ]
        );
    }

    #[test]
    fn recipients_are_the_compiled_in_list() {
        assert!(!RECIPIENTS.is_empty());
        assert!(RECIPIENTS
            .iter()
            .all(|r| r.chars().all(|c| c.is_ascii_digit())));
    }
}
