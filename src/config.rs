//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Settings infrastructure: configuration errors and the accessors used
//! by the settings types of every module and action to pull fields out
//! of a `toml::Value` sub-tree.
//!
//! Settings are realized as plain structs built by free functions
//! (`from_toml`) rather than a trait hierarchy: there is no behavior to
//! share beyond the field accessors below, and each settings type knows
//! how to parse only itself.

use std::fmt;

use toml::Value;

#[derive(Debug)]
pub enum ConfigError {
    MissingField { path: String, field: &'static str },
    WrongType { path: String, field: &'static str, expected: &'static str },
    MissingSection(String),
    UnknownModule(String),
    UnknownAction { module: String, action: String },
    InvalidActionName { name: String, reason: &'static str },
    Invalid { path: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingField { path, field } => {
                write!(f, "{path}: missing required field '{field}'")
            }
            ConfigError::WrongType { path, field, expected } => {
                write!(f, "{path}: field '{field}' should be {expected}")
            }
            ConfigError::MissingSection(name) => {
                write!(f, "missing required section '{name}'")
            }
            ConfigError::UnknownModule(name) => {
                write!(f, "no such module '{name}'")
            }
            ConfigError::UnknownAction { module, action } => {
                write!(f, "action '{action}' not defined in module '{module}'")
            }
            ConfigError::InvalidActionName { name, reason } => {
                write!(f, "invalid action name '{name}': {reason}")
            }
            ConfigError::Invalid { path, message } => {
                write!(f, "{path}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A config sub-tree together with a dotted path, used purely to make
/// `ConfigError` messages point at the offending field.
#[derive(Clone, Copy)]
pub struct Tree<'a> {
    pub value: &'a Value,
    pub path: &'a str,
}

impl<'a> Tree<'a> {
    pub fn new(value: &'a Value, path: &'a str) -> Tree<'a> {
        Tree { value, path }
    }

    pub fn get(&self, field: &'static str) -> Option<&'a Value> {
        self.value.get(field)
    }

    pub fn require(&self, field: &'static str) -> Result<&'a Value, ConfigError> {
        self.get(field).ok_or_else(|| ConfigError::MissingField {
            path: self.path.to_owned(),
            field,
        })
    }

    pub fn str(&self, field: &'static str) -> Result<String, ConfigError> {
        self.require(field)?
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| self.wrong_type(field, "a string"))
    }

    pub fn str_opt(&self, field: &'static str) -> Result<Option<String>, ConfigError> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_owned()))
                .ok_or_else(|| self.wrong_type(field, "a string")),
        }
    }

    pub fn bool_or(&self, field: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(field) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| self.wrong_type(field, "a boolean")),
        }
    }

    pub fn int_or(&self, field: &'static str, default: i64) -> Result<i64, ConfigError> {
        match self.get(field) {
            None => Ok(default),
            Some(v) => v.as_integer().ok_or_else(|| self.wrong_type(field, "an integer")),
        }
    }

    pub fn array(&self, field: &'static str) -> Result<&'a [Value], ConfigError> {
        self.require(field)?
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| self.wrong_type(field, "an array"))
    }

    pub fn array_or_empty(&self, field: &'static str) -> Result<&'a [Value], ConfigError> {
        match self.get(field) {
            None => Ok(&[]),
            Some(v) => v
                .as_array()
                .map(Vec::as_slice)
                .ok_or_else(|| self.wrong_type(field, "an array")),
        }
    }

    pub fn subtree(&self, field: &'static str) -> Result<Tree<'a>, ConfigError> {
        let value = self.require(field)?;
        Ok(Tree::new(value, field))
    }

    fn wrong_type(&self, field: &'static str, expected: &'static str) -> ConfigError {
        ConfigError::WrongType {
            path: self.path.to_owned(),
            field,
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_missing_field_errors() {
        let value: Value = toml::from_str("a = 1").unwrap();
        let tree = Tree::new(&value, "mod");
        let err = tree.require("b").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn str_wrong_type_errors() {
        let value: Value = toml::from_str("a = 1").unwrap();
        let tree = Tree::new(&value, "mod");
        let err = tree.str("a").unwrap_err();
        assert!(matches!(err, ConfigError::WrongType { .. }));
    }
}
