use crate::model::Config;

/// Outcome of looking up the unique `(namespace, server, tool)` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// No rule exists; the namespace's `denyByDefault` applies.
    Unset,
}

/// Look up the explicit permission rule, if any.
///
/// The triple is unique after validation; last-match-wins keeps the
/// function total over unvalidated input.
pub fn check(config: &Config, namespace: &str, server: &str, tool: &str) -> Decision {
    let mut decision = Decision::Unset;
    for rule in &config.tool_permissions {
        if rule.namespace == namespace && rule.server == server && rule.tool_name == tool {
            decision = if rule.enabled {
                Decision::Allow
            } else {
                Decision::Deny
            };
        }
    }
    decision
}

/// Decide whether `namespace` exposes `server`'s `tool`, with the reason.
///
/// - No active namespace (selection = all): allow.
/// - Namespace missing from the config: allow. This is the fail-open ghost
///   namespace behavior; callers surface it with a warning log.
/// - Explicit rule: respected.
/// - Otherwise the namespace's `denyByDefault` decides.
pub fn is_allowed(
    config: &Config,
    namespace: Option<&str>,
    server: &str,
    tool: &str,
) -> (bool, &'static str) {
    let Some(namespace) = namespace.filter(|ns| !ns.is_empty()) else {
        return (true, "no active namespace");
    };

    let Some(ns_config) = config.namespaces.get(namespace) else {
        return (true, "namespace not present in config");
    };

    match check(config, namespace, server, tool) {
        Decision::Allow => (true, "explicitly allowed"),
        Decision::Deny => (false, "explicitly denied"),
        Decision::Unset => {
            if ns_config.deny_by_default {
                (false, "namespace denies by default")
            } else {
                (true, "namespace allows by default")
            }
        }
    }
}
