//! Process-wide string configuration map.
//!
//! Backs the `GETENV` / `SETENV` commands. Every key of the startup
//! configuration is mirrored in here so services can inspect node
//! settings (`logpath`, `thread`, custom keys) uniformly. The map is a
//! field of the node, not a process global.

use std::collections::HashMap;
use std::sync::RwLock;

/// A concurrent string-to-string map with read-mostly access.
#[derive(Debug, Default)]
pub struct Env {
    vars: RwLock<HashMap<String, String>>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.read().expect("env lock poisoned").get(key).cloned()
    }

    /// Set a key, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.vars
            .write()
            .expect("env lock poisoned")
            .insert(key.into(), value.into());
    }

    /// Read an integer key, storing and returning `default` when unset.
    pub fn opt_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(v) => v.parse().unwrap_or(default),
            None => {
                self.set(key, default.to_string());
                default
            }
        }
    }

    /// Read a boolean key (`"true"` / `"false"`), storing and returning
    /// `default` when unset.
    pub fn opt_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v == "true",
            None => {
                self.set(key, if default { "true" } else { "false" });
                default
            }
        }
    }

    /// Read a string key, storing and returning `default` when unset.
    pub fn opt_str(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(v) => v,
            None => {
                self.set(key, default);
                default.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let env = Env::new();
        env.set("logpath", "/tmp/warren");
        assert_eq!(env.get("logpath").as_deref(), Some("/tmp/warren"));
        assert_eq!(env.get("missing"), None);
    }

    #[test]
    fn opt_int_stores_default_once() {
        let env = Env::new();
        assert_eq!(env.opt_int("thread", 8), 8);
        assert_eq!(env.get("thread").as_deref(), Some("8"));
        env.set("thread", "4");
        assert_eq!(env.opt_int("thread", 8), 4);
    }

    #[test]
    fn opt_bool_round_trip() {
        let env = Env::new();
        assert!(env.opt_bool("profile", true));
        assert_eq!(env.get("profile").as_deref(), Some("true"));
        env.set("profile", "false");
        assert!(!env.opt_bool("profile", true));
    }
}
