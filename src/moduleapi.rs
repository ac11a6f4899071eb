//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! API shared by all modules and actions: the module/action traits,
//! action context and lists, and the aggregate run status.

use std::fmt;

use crate::dispatch::Dispatcher;

/// Return status for a module's `run`, in order of severity so that
/// `max()` across modules/checks yields the right aggregate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ModuleRunStatus {
    Ok = 0,
    CheckFailed = 1,
    ActionError = 2,
    UnknownError = 3,
}

impl ModuleRunStatus {
    pub fn exit_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ModuleRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleRunStatus::Ok => "ok",
            ModuleRunStatus::CheckFailed => "check_failed",
            ModuleRunStatus::ActionError => "action_error",
            ModuleRunStatus::UnknownError => "unknown_error",
        };
        write!(f, "{s}")
    }
}

/// Turns a "did every on_error action succeed?" bool into the pair of
/// `ModuleRunStatus` values a failed check can produce.
pub fn check_failed_status(actions_ok: bool) -> ModuleRunStatus {
    if actions_ok {
        ModuleRunStatus::CheckFailed
    } else {
        ModuleRunStatus::ActionError
    }
}

/// Context passed down to an action: who triggered it and why.
#[derive(Clone, Debug)]
pub struct ActionContext {
    pub calling_module: String,
    pub message: String,
}

impl ActionContext {
    pub fn new(calling_module: impl Into<String>, message: impl Into<String>) -> ActionContext {
        ActionContext {
            calling_module: calling_module.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct ActionError(pub String);

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ActionError {}

impl From<String> for ActionError {
    fn from(s: String) -> ActionError {
        ActionError(s)
    }
}

impl From<&str> for ActionError {
    fn from(s: &str) -> ActionError {
        ActionError(s.to_owned())
    }
}

/// Settings for a single configured action entry: its absolute
/// `module.action` name plus whatever the concrete action needs, kept
/// behind `Any` so `ActionListSettings` can hold a heterogeneous list.
pub trait ActionSettings: std::fmt::Debug + Send + Sync {
    fn action_name(&self) -> &str;
    fn as_any(&self) -> &dyn std::any::Any;
    fn clone_box(&self) -> Box<dyn ActionSettings>;
}

impl Clone for Box<dyn ActionSettings> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A parsed `on_error`/`on_fail_or_output` list: settings only, actions
/// are resolved and constructed at execution time.
#[derive(Debug, Default, Clone)]
pub struct ActionListSettings {
    pub entries: Vec<Box<dyn ActionSettings>>,
}

/// A runnable action list, bound to the dispatcher that resolves its
/// entries' module/action names.
pub struct ActionList<'a> {
    settings: &'a ActionListSettings,
}

impl<'a> ActionList<'a> {
    pub fn new(settings: &'a ActionListSettings) -> ActionList<'a> {
        ActionList { settings }
    }

    /// Runs every configured action in order. Does not short-circuit on
    /// error; returns `true` iff every action completed without error.
    pub fn run(&self, dispatch: &Dispatcher, context: &ActionContext) -> bool {
        let mut all_ok = true;
        for settings in &self.settings.entries {
            if let Err(e) = dispatch.execute_action(settings.as_ref(), context) {
                tracing::error!(action = settings.action_name(), error = %e, "action failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

/// An action bound to its owning module instance and settings.
pub trait Action {
    fn execute(&self, context: &ActionContext) -> Result<(), ActionError>;
}

/// The API every module exposes to the dispatcher.
pub trait ModuleApi: Send + Sync {
    fn name(&self) -> &str;

    /// Runs this module's configured checks/behavior. Modules with no
    /// independent behavior (pure action providers) can return `Ok`
    /// unconditionally.
    fn run(&self, dispatch: &Dispatcher) -> ModuleRunStatus {
        let _ = dispatch;
        ModuleRunStatus::Ok
    }

    /// Builds the action named by `action_name` (this module's local
    /// name, e.g. `"sendmail"`) from its parsed settings. `dispatch` is
    /// threaded through for actions that themselves run a nested
    /// action list (e.g. the process module's `on_fail_or_output`).
    fn make_action<'a>(
        &'a self,
        action_name: &str,
        settings: &dyn ActionSettings,
        dispatch: &'a Dispatcher,
    ) -> Result<Box<dyn Action + 'a>, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_gives_max_severity() {
        assert_eq!(
            ModuleRunStatus::Ok.max(ModuleRunStatus::CheckFailed),
            ModuleRunStatus::CheckFailed
        );
        assert_eq!(
            ModuleRunStatus::CheckFailed.max(ModuleRunStatus::ActionError),
            ModuleRunStatus::ActionError
        );
    }

    #[test]
    fn exit_code_matches_ordinal() {
        assert_eq!(ModuleRunStatus::ActionError.exit_code(), 2);
    }

    #[test]
    fn check_failed_status_picks_action_error_on_failure() {
        assert_eq!(check_failed_status(true), ModuleRunStatus::CheckFailed);
        assert_eq!(check_failed_status(false), ModuleRunStatus::ActionError);
    }
}
