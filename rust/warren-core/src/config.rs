//! Node startup configuration.
//!
//! Deserialized from a TOML file by the CLI; every field (plus any entry
//! of the `[env]` table) is mirrored into the node's [`Env`](crate::Env)
//! so services can read it back through `GETENV`.

use std::collections::HashMap;

use serde::Deserialize;

use crate::env::Env;

/// Node configuration with the stock defaults applied for absent keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker thread count. `0` lets the runtime pick one per CPU core.
    pub thread: usize,
    /// Node id for cross-node handles (upper 8 handle bits).
    pub harbor: u8,
    /// First user service, as `"module args..."`. Optional: a node can
    /// run with only services launched by an embedding host.
    pub bootstrap: Option<String>,
    /// Argument handed to the logger module (a file path, or absent for
    /// stdout).
    pub logger: Option<String>,
    /// Name of the module that provides the logger service.
    pub logservice: String,
    /// Enable per-service CPU accounting.
    pub profile: bool,
    /// Directory for per-service raw message traces (`LOGON`).
    pub logpath: Option<String>,
    /// Extra keys exposed verbatim through `GETENV`.
    pub env: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            thread: 8,
            harbor: 1,
            bootstrap: None,
            logger: None,
            logservice: "logger".to_string(),
            profile: true,
            logpath: None,
            env: HashMap::new(),
        }
    }
}

impl Config {
    /// Mirror every setting into the node environment map.
    pub fn seed_env(&self, env: &Env) {
        env.set("thread", self.thread.to_string());
        env.set("harbor", self.harbor.to_string());
        env.set("logservice", self.logservice.clone());
        env.set("profile", if self.profile { "true" } else { "false" });
        if let Some(bootstrap) = &self.bootstrap {
            env.set("bootstrap", bootstrap.clone());
        }
        if let Some(logger) = &self.logger {
            env.set("logger", logger.clone());
        }
        if let Some(logpath) = &self.logpath {
            env.set("logpath", logpath.clone());
        }
        for (k, v) in &self.env {
            env.set(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_node() {
        let c = Config::default();
        assert_eq!(c.thread, 8);
        assert_eq!(c.harbor, 1);
        assert_eq!(c.logservice, "logger");
        assert!(c.profile);
        assert!(c.bootstrap.is_none());
    }

    #[test]
    fn seed_env_exposes_all_keys() {
        let mut c = Config::default();
        c.logpath = Some("/tmp/traces".to_string());
        c.env.insert("gate_port".to_string(), "8888".to_string());
        let env = Env::new();
        c.seed_env(&env);
        assert_eq!(env.get("thread").as_deref(), Some("8"));
        assert_eq!(env.get("logpath").as_deref(), Some("/tmp/traces"));
        assert_eq!(env.get("gate_port").as_deref(), Some("8888"));
    }
}
