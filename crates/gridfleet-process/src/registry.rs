//! Install directory lookup in the Windows registry.
//!
//! Read through `reg query`, so no Windows API bindings are needed.

use std::path::PathBuf;

use gridfleet_core::config::NativeConfig;

/// Install directory from `native.registry_key`, when configured and
/// present. Always `None` off Windows.
pub fn install_path(config: &NativeConfig) -> Option<PathBuf> {
    let key = config.registry_key.as_deref().filter(|k| !k.is_empty())?;
    query(key, &config.registry_value).map(PathBuf::from)
}

#[cfg(windows)]
fn query(key: &str, value: &str) -> Option<String> {
    let output = std::process::Command::new("reg")
        .args(["query", key, "/v", value])
        .output()
        .map_err(|e| tracing::warn!(key, value, error = %e, "cannot run reg query"))
        .ok()?;
    if !output.status.success() {
        tracing::debug!(key, value, "registry value not found");
        return None;
    }
    parse_reg_query(&String::from_utf8_lossy(&output.stdout), value)
}

#[cfg(not(windows))]
fn query(_key: &str, _value: &str) -> Option<String> {
    None
}

/// Data of `value` from `reg query` output:
///
/// ```text
/// HKEY_LOCAL_MACHINE\SOFTWARE\GridServer
///     InstallPath    REG_SZ    C:\Grid Server\bin
/// ```
pub fn parse_reg_query(output: &str, value: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(value)?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let (kind, data) = rest.trim_start().split_once(char::is_whitespace)?;
        if !kind.starts_with("REG_") {
            return None;
        }
        let data = data.trim();
        (!data.is_empty()).then(|| data.to_string())
    })
}
