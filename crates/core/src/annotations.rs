//! Well-known metadata keys read and written by the engine.

/// Integer sync wave; absent means wave 0.
pub const SYNC_WAVE: &str = "kairo.dev/sync-wave";
/// Comma separated hook phases (`PreSync`, `Sync`, `PostSync`, `SyncFail`).
pub const HOOK: &str = "kairo.dev/hook";
/// Comma separated hook delete policies.
pub const HOOK_DELETE_POLICY: &str = "kairo.dev/hook-delete-policy";
/// Comma separated `Key=Value` sync options, e.g. `Prune=false`.
pub const SYNC_OPTIONS: &str = "kairo.dev/sync-options";
/// Desired manifest as last applied, JSON encoded. Lets a later comparison notice
/// fields that were removed from the desired manifest.
pub const LAST_APPLIED: &str = "kairo.dev/last-applied";
/// Label stamped on every applied resource, valued with the application name.
pub const TRACKING_LABEL: &str = "app.kubernetes.io/instance";

/// Look up a `Key=Value` entry in a sync-options annotation value.
pub fn sync_option<'a>(value: &'a str, key: &str) -> Option<&'a str> {
    value
        .split(',')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}
