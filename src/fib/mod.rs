//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Abstract interface to an underlying kernel FIB.

pub mod linux;

use std::fmt;

use crate::route::{AddressFamily, Route, RouteMatch};

#[derive(Debug)]
pub enum FibError {
    NotImplemented,
    Operation { message: String, cause: Option<String> },
}

impl FibError {
    pub fn op(message: impl Into<String>) -> FibError {
        FibError::Operation {
            message: message.into(),
            cause: None,
        }
    }

    pub fn op_with_cause(message: impl Into<String>, cause: impl fmt::Display) -> FibError {
        FibError::Operation {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }
}

impl fmt::Display for FibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FibError::NotImplemented => write!(f, "operation not implemented"),
            FibError::Operation { message, cause: Some(cause) } => {
                write!(f, "{message}: {cause}")
            }
            FibError::Operation { message, cause: None } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for FibError {}

/// Contract for a FIB backend. Every mutator has upsert/error semantics
/// documented on the method; unsupported operations return
/// `FibError::NotImplemented`.
pub trait FibInterface: Send + Sync {
    fn get_routes(&self, family: AddressFamily) -> Result<Vec<Route>, FibError>;

    fn add_route(&self, route: &Route) -> Result<(), FibError>;

    fn change_route(&self, route: &Route) -> Result<(), FibError> {
        let _ = route;
        Err(FibError::NotImplemented)
    }

    fn delete_route(&self, route: &Route) -> Result<(), FibError> {
        let _ = route;
        Err(FibError::NotImplemented)
    }

    /// Upserts `route`: replaces it if a matching route exists, adds it
    /// otherwise.
    fn replace_route(&self, route: &Route) -> Result<(), FibError>;

    fn get_default_routes(&self, family: AddressFamily) -> Result<Vec<Route>, FibError>;

    /// Returns the most specific route matching `rm`, or `None` if no
    /// such route exists.
    fn get_route_to(&self, rm: &RouteMatch) -> Result<Option<Route>, FibError>;
}
