use std::path::PathBuf;

pub const DEFAULT_DB_PATH: &str = "data/loco.db";
pub const DEFAULT_LOG_DIR: &str = ".loco/logs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub log_dir: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub debug: bool,
}

/// Flag values as parsed by clap; empty strings mean "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigFlags {
    pub db: String,
    pub log_dir: String,
    pub debug: bool,
}

pub fn load_config(flags: &ConfigFlags) -> Config {
    resolve_config(flags, |key| std::env::var(key).ok())
}

fn resolve_config(flags: &ConfigFlags, env: impl Fn(&str) -> Option<String>) -> Config {
    let db_path = first_non_empty(&flags.db, env("LOCO_DB_PATH"))
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let log_dir = first_non_empty(&flags.log_dir, env("LOCO_LOG_DIR"))
        .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
    let debug = flags.debug || env("LOCO_DEBUG").is_some_and(|value| is_true(&value));
    let log_filter = if debug {
        "debug".to_string()
    } else {
        env("LOCO_LOG_LEVEL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "info".to_string())
    };

    Config {
        db_path: PathBuf::from(db_path),
        log_dir,
        log_filter,
        debug,
    }
}

fn first_non_empty(flag: &str, env_value: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    env_value.filter(|value| !value.trim().is_empty())
}

fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let config = resolve_config(&ConfigFlags::default(), env_of(&[]));
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.log_dir, DEFAULT_LOG_DIR);
        assert_eq!(config.log_filter, "info");
        assert!(!config.debug);
    }

    #[test]
    fn flags_win_over_environment() {
        let flags = ConfigFlags {
            db: "/srv/loco/flag.db".to_string(),
            log_dir: String::new(),
            debug: false,
        };
        let config = resolve_config(
            &flags,
            env_of(&[
                ("LOCO_DB_PATH", "/srv/loco/env.db"),
                ("LOCO_LOG_DIR", "/var/log/loco"),
                ("LOCO_LOG_LEVEL", "warn"),
                ("LOCO_DEBUG", "Yes"),
            ]),
        );
        assert_eq!(config.db_path, PathBuf::from("/srv/loco/flag.db"));
        assert_eq!(config.log_dir, "/var/log/loco");
        assert_eq!(config.log_filter, "debug");
        assert!(config.debug);
    }

    #[test]
    fn log_level_applies_unless_debugging() {
        let config = resolve_config(
            &ConfigFlags::default(),
            env_of(&[("LOCO_LOG_LEVEL", "warn,loco_ingest=trace")]),
        );
        assert_eq!(config.log_filter, "warn,loco_ingest=trace");
        assert!(!config.debug);
    }

    #[test]
    fn blank_environment_values_are_ignored() {
        let config = resolve_config(
            &ConfigFlags::default(),
            env_of(&[("LOCO_DB_PATH", "  "), ("LOCO_DEBUG", "0")]),
        );
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert!(!config.debug);
    }
}
