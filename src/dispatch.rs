//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Module registry, configuration loading and action dispatch.
//!
//! Loading happens in two passes over the configured `modules` list:
//! first every name is resolved to its static [`ModuleFactory`] (the
//! "class" phase), then each module's settings are parsed and its API
//! instantiated (the "instance" phase). Settings parsed in the second
//! pass may reference actions belonging to a module later in the list,
//! because the factory lookup only needs the first pass to have run.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::config::{ConfigError, Tree};
use crate::moduleapi::{Action, ActionContext, ActionError, ActionSettings, ModuleApi, ModuleRunStatus};

/// Static description of a compiled-in module: how to parse its
/// settings and build its API instance, and how to parse the settings
/// of one of its actions given the action's local name.
pub struct ModuleFactory {
    pub name: &'static str,
    pub actions: &'static [&'static str],
    pub load: fn(&Tree<'_>, &Configurator) -> Result<Box<dyn ModuleApi>, ConfigError>,
    pub parse_action: fn(&str, &Tree<'_>, &Configurator) -> Result<Box<dyn ActionSettings>, ConfigError>,
}

#[derive(Debug)]
pub struct DispatchError(pub String);

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// Splits an absolute action name (`module.action`) into its parts.
/// Relative names (no dot) are rejected at configuration time: a
/// generic module like the FIB one has no stable notion of "the
/// calling module" while its own settings are being parsed.
pub fn split_action_name(name: &str) -> Result<(&str, &str), ConfigError> {
    match name.rsplit_once('.') {
        None => Err(ConfigError::InvalidActionName {
            name: name.to_owned(),
            reason: "missing module name",
        }),
        Some((module, _)) if module.is_empty() => Err(ConfigError::InvalidActionName {
            name: name.to_owned(),
            reason: "missing module name",
        }),
        Some((_, action)) if action.is_empty() => Err(ConfigError::InvalidActionName {
            name: name.to_owned(),
            reason: "missing action name",
        }),
        Some((module, action)) => Ok((module, action)),
    }
}

/// Resolves module names to their static factories and parses per-action
/// settings on behalf of modules that own `on_error`/`on_fail_or_output`
/// lists.
pub struct Configurator {
    classes: HashMap<String, &'static ModuleFactory>,
}

impl Configurator {
    /// Parses one entry of an action list (a config tree with an
    /// `action` field naming an absolute `module.action`).
    pub fn configure_action(&self, tree: &Tree<'_>) -> Result<Box<dyn ActionSettings>, ConfigError> {
        let action_name = tree.str("action")?;
        let (module_name, action) = split_action_name(&action_name)?;

        let factory = self
            .classes
            .get(module_name)
            .ok_or_else(|| ConfigError::UnknownModule(module_name.to_owned()))?;

        if !factory.actions.contains(&action) {
            return Err(ConfigError::UnknownAction {
                module: module_name.to_owned(),
                action: action.to_owned(),
            });
        }

        (factory.parse_action)(action, tree, self)
    }
}

struct ModuleInfo {
    factory: &'static ModuleFactory,
    api: Box<dyn ModuleApi>,
}

/// Owns the loaded modules and runs them in declaration order, resolving
/// and executing actions on their behalf.
pub struct Dispatcher {
    order: Vec<String>,
    modules: HashMap<String, ModuleInfo>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("order", &self.order).finish()
    }
}

impl Dispatcher {
    /// A dispatcher with no loaded modules, for module unit tests that
    /// only need something to hand to `ActionList::run` on an empty list.
    #[cfg(test)]
    pub(crate) fn empty() -> Dispatcher {
        Dispatcher { order: Vec::new(), modules: HashMap::new() }
    }

    /// Parses `config_path` and loads every module it names. Returns
    /// `DispatchError` if the `modules` section is missing or any
    /// module failed to load; per-module errors are logged before the
    /// aggregate error is returned.
    pub fn load(config_path: &Path, registry: &'static [(&'static str, ModuleFactory)]) -> Result<Dispatcher, DispatchError> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| DispatchError(format!("failed to read '{}': {e}", config_path.display())))?;
        let root: toml::Value = toml::from_str(&config_str)
            .map_err(|e| DispatchError(format!("failed to parse configuration: {e}")))?;

        let module_names = root
            .get("modules")
            .and_then(|v| v.as_array())
            .ok_or_else(|| DispatchError("missing mandatory section 'modules'".to_owned()))?;

        let by_name: HashMap<&str, &'static ModuleFactory> =
            registry.iter().map(|(name, f)| (*name, f)).collect();

        // Phase 1: resolve classes, deduplicating while preserving order.
        let mut order = Vec::new();
        let mut classes = HashMap::new();
        let mut errors = false;
        for name_value in module_names {
            let Some(name) = name_value.as_str() else {
                tracing::error!("entries of 'modules' must be strings");
                errors = true;
                continue;
            };
            if classes.contains_key(name) {
                tracing::warn!(module = name, "ignoring duplicate entry, already loaded");
                continue;
            }
            match by_name.get(name) {
                Some(factory) => {
                    classes.insert(name.to_owned(), *factory);
                    order.push(name.to_owned());
                }
                None => {
                    tracing::error!(module = name, "no such module");
                    errors = true;
                }
            }
        }

        let configurator = Configurator { classes };

        // Phase 2: parse settings and instantiate, now that every
        // sibling module's class is resolvable for forward references.
        let mut modules = HashMap::new();
        for name in &order {
            let factory = configurator.classes[name];
            let section = match root.get(name.as_str()) {
                Some(v) => v,
                None => {
                    tracing::error!(module = name, "missing required section '{name}'");
                    errors = true;
                    continue;
                }
            };
            let tree = Tree::new(section, name);
            match (factory.load)(&tree, &configurator) {
                Ok(api) => {
                    modules.insert(name.clone(), ModuleInfo { factory, api });
                }
                Err(e) => {
                    tracing::error!(module = name, error = %e, "failed to load");
                    errors = true;
                }
            }
        }

        if errors {
            return Err(DispatchError("errors while loading modules".to_owned()));
        }

        // Only modules that both resolved and loaded successfully stay
        // in `order`; with `errors == false` this is all of them.
        order.retain(|name| modules.contains_key(name));

        Ok(Dispatcher { order, modules })
    }

    /// Runs every loaded module in declaration order and returns the
    /// most severe `ModuleRunStatus` observed.
    pub fn run(&self) -> ModuleRunStatus {
        let mut status = ModuleRunStatus::Ok;
        for name in &self.order {
            let info = &self.modules[name];
            tracing::debug!(module = name, "running module");
            status = status.max(info.api.run(self));
        }
        status
    }

    /// Resolves and executes a single configured action.
    pub fn execute_action(&self, settings: &dyn ActionSettings, context: &ActionContext) -> Result<(), ActionError> {
        let (module_name, action_name) = split_action_name(settings.action_name())
            .map_err(|e| ActionError(e.to_string()))?;

        let info = self
            .modules
            .get(module_name)
            .ok_or_else(|| ActionError(format!("no such module '{module_name}' in action definition")))?;

        tracing::debug!(
            action = settings.action_name(),
            calling_module = %context.calling_module,
            "executing action"
        );

        let action: Box<dyn Action + '_> = info.api.make_action(action_name, settings, self)?;
        action.execute(context)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn split_action_name_requires_module_and_action() {
        assert!(split_action_name("email.sendmail").is_ok());
        assert!(split_action_name("sendmail").is_err());
        assert!(split_action_name("email.").is_err());
        assert!(split_action_name(".sendmail").is_err());
    }

    #[test]
    fn split_action_name_reports_missing_module_name() {
        let err = split_action_name("sendmail").unwrap_err();
        assert!(err.to_string().contains("missing module name"));

        let err = split_action_name(".sendmail").unwrap_err();
        assert!(err.to_string().contains("missing module name"));
    }

    #[test]
    fn split_action_name_reports_missing_action_name() {
        let err = split_action_name("email.").unwrap_err();
        assert!(err.to_string().contains("missing action name"));
    }

    #[test]
    fn split_action_name_uses_rightmost_dot() {
        let (module, action) = split_action_name("a.b.c").unwrap();
        assert_eq!(module, "a.b");
        assert_eq!(action, "c");
    }

    /// A reference to an action whose owning module isn't in `modules`
    /// is a ConfigError raised during loading, before any check runs.
    /// This never reaches `LinuxFib::new()` (and so needs no netlink
    /// access) because `on_error` is parsed before the FIB module
    /// constructs its backend.
    #[test]
    fn load_fails_on_reference_to_unloaded_module() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            modules = ["fib_linux"]

            [fib_linux]
            route_checks = [
                {{ dest = "1.2.3.4/32", non_null = true, on_error = [ {{ action = "email.sendmail" }} ] }}
            ]
            "#
        )
        .unwrap();

        let err = super::Dispatcher::load(file.path(), &crate::modules::REGISTRY).unwrap_err();
        assert!(err.0.contains("errors while loading"));
    }

    #[test]
    fn load_fails_on_unknown_module_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"modules = ["no_such_module"]"#).unwrap();

        assert!(super::Dispatcher::load(file.path(), &crate::modules::REGISTRY).is_err());
    }
}
