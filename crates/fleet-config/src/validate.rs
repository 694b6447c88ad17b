use anyhow::{Result, bail};
use std::collections::HashSet;

use crate::model::{Config, MANAGER_PREFIX, SCHEMA_VERSION};

/// Validate a parsed config snapshot.
///
/// Hard failures: unsupported schema version, malformed server names, a
/// server colliding with the reserved manager prefix, a dangling
/// `defaultNamespace`, duplicate permission triples. Namespaces that
/// reference unknown servers only warn; the references are ignored at
/// runtime.
pub fn validate(config: &Config) -> Result<()> {
    if config.schema_version > SCHEMA_VERSION {
        bail!(
            "config schema version {} is newer than supported version {}",
            config.schema_version,
            SCHEMA_VERSION
        );
    }

    for name in config.servers.keys() {
        if name.is_empty() {
            bail!("server names must be non-empty");
        }
        if name == MANAGER_PREFIX {
            bail!("server name '{name}' collides with the reserved manager-tool prefix");
        }
        if name.contains('.') {
            bail!("server name '{name}' may not contain '.' (reserved as the tool-name delimiter)");
        }
        if name.chars().any(char::is_whitespace) {
            bail!("server name '{name}' may not contain whitespace");
        }
    }

    if let Some(default) = config.default_namespace.as_deref() {
        if !config.namespaces.contains_key(default) {
            bail!("defaultNamespace '{default}' does not name a configured namespace");
        }
    }

    let mut seen = HashSet::new();
    for rule in &config.tool_permissions {
        let key = (
            rule.namespace.as_str(),
            rule.server.as_str(),
            rule.tool_name.as_str(),
        );
        if !seen.insert(key) {
            bail!(
                "duplicate tool permission for ({}, {}, {})",
                rule.namespace,
                rule.server,
                rule.tool_name
            );
        }
        if !config.namespaces.contains_key(&rule.namespace) {
            tracing::warn!(
                namespace = %rule.namespace,
                server = %rule.server,
                tool = %rule.tool_name,
                "tool permission references an unknown namespace"
            );
        }
    }

    for (ns_name, ns) in &config.namespaces {
        for server in &ns.server_names {
            if !config.servers.contains_key(server) {
                tracing::warn!(
                    namespace = %ns_name,
                    server = %server,
                    "namespace references an unknown server; it will be ignored"
                );
            }
        }
    }

    Ok(())
}
