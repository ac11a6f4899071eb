//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Compiled-in modules and their static registry.

pub mod email;
pub mod fib;
pub mod process;

use crate::dispatch::ModuleFactory;

pub static REGISTRY: &[(&str, ModuleFactory)] = &[
    (fib::NAME, fib::FACTORY),
    (process::NAME, process::FACTORY),
    (email::NAME, email::FACTORY),
];
