use fleet_config::Config;

use crate::errors::RpcError;

/// How the active namespace was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    /// Explicit `--namespace` argument.
    Flag,
    /// `defaultNamespace` from the config.
    Default,
    /// The config holds exactly one namespace.
    Only,
    /// No namespaces configured; every enabled server is active.
    All,
}

impl SelectionMethod {
    pub fn label(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Default => "default",
            Self::Only => "only",
            Self::All => "all",
        }
    }
}

/// The namespace (and server set) currently exposed to the client.
#[derive(Debug, Clone)]
pub struct ActiveSelection {
    pub namespace: Option<String>,
    pub server_names: Vec<String>,
    pub method: SelectionMethod,
}

impl ActiveSelection {
    pub fn contains_server(&self, name: &str) -> bool {
        self.server_names.iter().any(|server| server == name)
    }
}

/// Select the active namespace. Five rules, first match wins:
///
/// 1. explicit flag naming an existing namespace;
/// 2. `defaultNamespace`, if it resolves;
/// 3. exactly one namespace configured;
/// 4. zero namespaces: all enabled servers, no namespace;
/// 5. two or more namespaces with no selection: refuse.
///
/// A flag that names a missing namespace is its own error rather than
/// falling through.
pub fn resolve(config: &Config, flag: Option<&str>) -> Result<ActiveSelection, RpcError> {
    if let Some(flag) = flag.filter(|flag| !flag.is_empty()) {
        if !config.namespaces.contains_key(flag) {
            return Err(RpcError::NamespaceNotFound(flag.to_string()));
        }
        return Ok(selection_for(config, flag, SelectionMethod::Flag));
    }

    if let Some(default) = config.default_namespace.as_deref() {
        if config.namespaces.contains_key(default) {
            return Ok(selection_for(config, default, SelectionMethod::Default));
        }
        tracing::warn!(namespace = %default, "defaultNamespace does not resolve; ignoring");
    }

    match config.namespaces.len() {
        1 => {
            let only = config.namespaces.keys().next().expect("len checked");
            Ok(selection_for(config, only, SelectionMethod::Only))
        }
        0 => Ok(ActiveSelection {
            namespace: None,
            server_names: config.enabled_server_names(),
            method: SelectionMethod::All,
        }),
        _ => Err(RpcError::InvalidRequest(format!(
            "{} namespaces configured but none selected; pass a namespace or set defaultNamespace",
            config.namespaces.len()
        ))),
    }
}

/// Re-evaluate the selection after a reload, preferring to keep what the
/// client already sees. Resolution failure keeps the previous selection
/// (fail-closed) with its server set recomputed against the new config.
pub fn reselect_after_reload(
    config: &Config,
    flag: Option<&str>,
    previous: &ActiveSelection,
) -> ActiveSelection {
    // The name to preserve: the original flag for a flag selection, else
    // whatever namespace was active.
    let preserved = match previous.method {
        SelectionMethod::Flag => flag,
        _ => previous.namespace.as_deref(),
    };

    if let Some(name) = preserved {
        if config.namespaces.contains_key(name) {
            return selection_for(config, name, previous.method);
        }
    } else if previous.method == SelectionMethod::All && config.namespaces.is_empty() {
        return ActiveSelection {
            namespace: None,
            server_names: config.enabled_server_names(),
            method: SelectionMethod::All,
        };
    }

    match resolve(config, flag) {
        Ok(selection) => selection,
        Err(error) => {
            tracing::warn!(
                error = %error,
                "namespace re-resolution failed after reload; keeping previous selection"
            );
            match previous.namespace.as_deref() {
                Some(name) => selection_for(config, name, previous.method),
                None => ActiveSelection {
                    namespace: None,
                    server_names: config.enabled_server_names(),
                    method: previous.method,
                },
            }
        }
    }
}

fn selection_for(config: &Config, namespace: &str, method: SelectionMethod) -> ActiveSelection {
    ActiveSelection {
        namespace: Some(namespace.to_string()),
        server_names: servers_for_namespace(config, namespace),
        method,
    }
}

/// Namespace members that actually exist in the config, in declaration
/// order; unknown references are ignored.
fn servers_for_namespace(config: &Config, namespace: &str) -> Vec<String> {
    let Some(ns) = config.namespaces.get(namespace) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for name in &ns.server_names {
        if config.servers.contains_key(name) && !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}
