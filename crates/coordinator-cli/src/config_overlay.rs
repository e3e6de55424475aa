//! Optional TOML file overlaying [`coordinator_core::config::Config`]'s
//! environment-variable defaults (§6).
//!
//! `Config::from_env()` is the single source of truth; this overlay only
//! sets the corresponding environment variables before that call runs, so a
//! config file and `COORDINATOR_*` env vars compose exactly the way an
//! operator expects (last writer wins, env wins if both are set externally).

use serde::Deserialize;
use std::path::Path;

/// Mirrors the subset of `Config::from_env()`'s environment variables an
/// operator is likely to want in a checked-in file rather than exported in
/// a shell profile.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct Overlay {
    backend: Option<String>,
    db_url: Option<String>,
    rest_prefix: Option<String>,
    lock_ttl_minutes: Option<String>,
    policy_engine: Option<String>,
    policy_cache_ttl_seconds: Option<String>,
    network_default_policy: Option<String>,
    port_allocator_base_port: Option<String>,
    port_allocator_range: Option<String>,
}

/// Load `path` and set the environment variables it names, then return. Does
/// nothing (and is not called) when no `--config` flag was given.
pub fn apply(path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("reading config file {}: {err}", path.display()))?;
    let overlay: Overlay = toml::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("parsing config file {}: {err}", path.display()))?;

    let set = |var: &str, value: &Option<String>| {
        if let Some(value) = value {
            std::env::set_var(var, value);
        }
    };
    set("COORDINATOR_BACKEND", &overlay.backend);
    set("COORDINATOR_DB_URL", &overlay.db_url);
    set("COORDINATOR_REST_PREFIX", &overlay.rest_prefix);
    set("LOCK_TTL_MINUTES", &overlay.lock_ttl_minutes);
    set("POLICY_ENGINE", &overlay.policy_engine);
    set("POLICY_CACHE_TTL_SECONDS", &overlay.policy_cache_ttl_seconds);
    set("NETWORK_DEFAULT_POLICY", &overlay.network_default_policy);
    set("PORT_ALLOCATOR_BASE_PORT", &overlay.port_allocator_base_port);
    set("PORT_ALLOCATOR_RANGE", &overlay.port_allocator_range);
    Ok(())
}
