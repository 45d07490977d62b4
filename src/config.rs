use std::env;
use std::path::PathBuf;

/// Runtime configuration, resolved once at startup.
///
/// Paths default to the conventional locations (`~/.macos-shell` for session
/// and process state, `~/.mcp-cache-rules.json` for learned cache rules) and
/// can be overridden through the environment for testing or sandboxed runs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Result caching enabled. `MCP_DISABLE_CACHE=true` turns the result
    /// cache off at runtime; dedup and retry stay active.
    pub cache_enabled: bool,
    /// Base directory for session and process persistence.
    pub data_dir: PathBuf,
    /// Path of the learned cache-rule file. A `.backup` sibling is written
    /// next to it before every rewrite.
    pub rules_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let cache_enabled = !env::var("MCP_DISABLE_CACHE")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if !cache_enabled {
            tracing::info!("MCP_DISABLE_CACHE set, result cache disabled");
        }

        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        let data_dir = env::var("SIROCCO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".macos-shell"));

        let rules_path = env::var("SIROCCO_RULES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".mcp-cache-rules.json"));

        Config {
            cache_enabled,
            data_dir,
            rules_path,
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn processes_dir(&self) -> PathBuf {
        self.data_dir.join("processes")
    }
}
