//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! FIB module: route checks against the kernel routing table, plus the
//! `add_route`/`replace_route` actions other modules' checks can invoke.

use std::any::Any;

use ipnetwork::IpNetwork;

use crate::config::{ConfigError, Tree};
use crate::dispatch::{Configurator, ModuleFactory};
use crate::fib::linux::LinuxFib;
use crate::fib::FibInterface;
use crate::moduleapi::{
    check_failed_status, Action, ActionContext, ActionError, ActionList, ActionListSettings,
    ActionSettings, ModuleApi, ModuleRunStatus,
};
use crate::route::{nexthops_str, NextHop, Route, RouteMatch, RouteType};

pub const NAME: &str = "fib_linux";
const ACTIONS: &[&str] = &["add_route", "replace_route"];

pub const FACTORY: ModuleFactory = ModuleFactory {
    name: NAME,
    actions: ACTIONS,
    load,
    parse_action,
};

/// Settings shared by `add_route` and `replace_route`: both install the
/// same kind of route, they differ only in upsert-vs-insert semantics.
#[derive(Debug, Clone)]
pub struct AddReplaceRouteSettings {
    action_name: String,
    route: Route,
}

impl ActionSettings for AddReplaceRouteSettings {
    fn action_name(&self) -> &str {
        &self.action_name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ActionSettings> {
        Box::new(self.clone())
    }
}

fn parse_add_replace_route(
    action_name: &str,
    tree: &Tree<'_>,
) -> Result<AddReplaceRouteSettings, ConfigError> {
    let dest: IpNetwork = tree
        .str("dest")?
        .parse()
        .map_err(|_| ConfigError::Invalid {
            path: tree.path.to_owned(),
            message: "'dest' is not a valid network".to_owned(),
        })?;

    let nexthop_strs = tree.array("nexthops")?;
    if nexthop_strs.is_empty() {
        return Err(ConfigError::Invalid {
            path: tree.path.to_owned(),
            message: "'nexthops' must be non-empty".to_owned(),
        });
    }
    let mut nexthops = Vec::with_capacity(nexthop_strs.len());
    for v in nexthop_strs {
        let s = v.as_str().ok_or_else(|| ConfigError::WrongType {
            path: tree.path.to_owned(),
            field: "nexthops",
            expected: "an array of strings",
        })?;
        let gw = s.parse().map_err(|_| ConfigError::Invalid {
            path: tree.path.to_owned(),
            message: format!("'{s}' is not a valid gateway address"),
        })?;
        nexthops.push(NextHop::new(Some(gw), None));
    }

    let metric = tree.int_or("metric", 1024)? as u32;
    let proto = tree.str_opt("proto")?.unwrap_or_else(|| "static".to_owned());

    let route = Route::new(dest, nexthops, Some(metric), proto, RouteType::Unicast);

    Ok(AddReplaceRouteSettings {
        action_name: action_name.to_owned(),
        route,
    })
}

struct AddRouteAction<'a> {
    module: &'a FibModule,
    settings: AddReplaceRouteSettings,
}

impl<'a> Action for AddRouteAction<'a> {
    fn execute(&self, _context: &ActionContext) -> Result<(), ActionError> {
        let r = &self.settings.route;
        tracing::info!(dest = %r.dest, via = %nexthops_str(&r.nexthops), "adding route");
        self.module
            .fib
            .add_route(r)
            .map_err(|e| ActionError(e.to_string()))
    }
}

struct ReplaceRouteAction<'a> {
    module: &'a FibModule,
    settings: AddReplaceRouteSettings,
}

impl<'a> Action for ReplaceRouteAction<'a> {
    fn execute(&self, _context: &ActionContext) -> Result<(), ActionError> {
        let r = &self.settings.route;
        tracing::info!(dest = %r.dest, via = %nexthops_str(&r.nexthops), "replacing route");
        self.module
            .fib
            .replace_route(r)
            .map_err(|e| ActionError(e.to_string()))
    }
}

/// A single `route_checks` entry.
#[derive(Debug)]
pub struct RouteCheckSettings {
    rm: RouteMatch,
    non_null: bool,
    nexthops_any: Vec<std::net::IpAddr>,
    on_error: ActionListSettings,
}

fn parse_route_check(
    tree: &Tree<'_>,
    configurator: &Configurator,
) -> Result<RouteCheckSettings, ConfigError> {
    let dest: IpNetwork = tree
        .str("dest")?
        .parse()
        .map_err(|_| ConfigError::Invalid {
            path: tree.path.to_owned(),
            message: "'dest' is not a valid network".to_owned(),
        })?;

    let mut non_null = tree.bool_or("non_null", false)?;

    let nexthops_any_values = tree.array_or_empty("nexthops_any")?;
    let mut nexthops_any = Vec::with_capacity(nexthops_any_values.len());
    for v in nexthops_any_values {
        let s = v.as_str().ok_or_else(|| ConfigError::WrongType {
            path: tree.path.to_owned(),
            field: "nexthops_any",
            expected: "an array of strings",
        })?;
        let addr = s.parse().map_err(|_| ConfigError::Invalid {
            path: tree.path.to_owned(),
            message: format!("'{s}' is not a valid address"),
        })?;
        nexthops_any.push(addr);
    }

    if !nexthops_any.is_empty() && !non_null {
        tracing::info!(dest = %dest, "route_check has required nexthops, forcing non_null");
        non_null = true;
    }

    let mut on_error = ActionListSettings::default();
    for v in tree.array_or_empty("on_error")? {
        let sub = Tree::new(v, "on_error");
        on_error.entries.push(configurator.configure_action(&sub)?);
    }

    Ok(RouteCheckSettings {
        rm: RouteMatch::with_dest(dest),
        non_null,
        nexthops_any,
        on_error,
    })
}

pub struct FibSettings {
    route_checks: Vec<RouteCheckSettings>,
}

fn load(tree: &Tree<'_>, configurator: &Configurator) -> Result<Box<dyn ModuleApi>, ConfigError> {
    let mut route_checks = Vec::new();
    for v in tree.array_or_empty("route_checks")? {
        let sub = Tree::new(v, "route_checks");
        route_checks.push(parse_route_check(&sub, configurator)?);
    }

    let fib = LinuxFib::new().map_err(|e| ConfigError::Invalid {
        path: tree.path.to_owned(),
        message: e.to_string(),
    })?;

    Ok(Box::new(FibModule {
        settings: FibSettings { route_checks },
        fib: Box::new(fib),
    }))
}

fn parse_action(
    action_name: &str,
    tree: &Tree<'_>,
    _configurator: &Configurator,
) -> Result<Box<dyn ActionSettings>, ConfigError> {
    let full_name = format!("{NAME}.{action_name}");
    Ok(Box::new(parse_add_replace_route(&full_name, tree)?))
}

pub struct FibModule {
    settings: FibSettings,
    fib: Box<dyn FibInterface>,
}

impl FibModule {
    fn route_check_failed(
        &self,
        dispatch: &crate::dispatch::Dispatcher,
        check: &RouteCheckSettings,
        reason: &str,
    ) -> bool {
        let dest = check.rm.dest.expect("route check always has a destination");
        tracing::warn!(dest = %dest, reason, "route_check failed");

        let context = ActionContext::new(
            NAME,
            format!("route_check: route to {dest} {reason}"),
        );
        ActionList::new(&check.on_error).run(dispatch, &context)
    }

    fn do_route_check(
        &self,
        check: &RouteCheckSettings,
        dispatch: &crate::dispatch::Dispatcher,
    ) -> ModuleRunStatus {
        let dest = check.rm.dest.expect("route check always has a destination");
        tracing::debug!(dest = %dest, "checking route");

        let r = match self.fib.get_route_to(&check.rm) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(dest = %dest, error = %e, "route lookup failed");
                let ok = self.route_check_failed(dispatch, check, &e.to_string());
                return check_failed_status(ok);
            }
        };

        let Some(r) = r else {
            let ok = self.route_check_failed(dispatch, check, "not found");
            return check_failed_status(ok);
        };

        tracing::debug!(dest = %dest, via = %nexthops_str(&r.nexthops), "route found");

        if check.non_null && r.is_null() {
            let reason = format!("{}, should be non-null", r.rt_type);
            let ok = self.route_check_failed(dispatch, check, &reason);
            return check_failed_status(ok);
        }

        if !check.nexthops_any.is_empty() {
            let matched = r
                .nexthops
                .iter()
                .any(|nh| nh.gateway.is_some_and(|gw| check.nexthops_any.contains(&gw)));
            if !matched {
                let reason = format!(
                    "via {}, not in [{}]",
                    nexthops_str(&r.nexthops),
                    check.nexthops_any
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                let ok = self.route_check_failed(dispatch, check, &reason);
                return check_failed_status(ok);
            }
        }

        tracing::info!(dest = %dest, "route_check satisfied");
        ModuleRunStatus::Ok
    }
}

impl ModuleApi for FibModule {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, dispatch: &crate::dispatch::Dispatcher) -> ModuleRunStatus {
        let mut status = ModuleRunStatus::Ok;
        for check in &self.settings.route_checks {
            status = status.max(self.do_route_check(check, dispatch));
        }
        status
    }

    fn make_action<'a>(
        &'a self,
        action_name: &str,
        settings: &dyn ActionSettings,
        _dispatch: &'a crate::dispatch::Dispatcher,
    ) -> Result<Box<dyn Action + 'a>, ActionError> {
        let settings = settings
            .as_any()
            .downcast_ref::<AddReplaceRouteSettings>()
            .ok_or_else(|| ActionError::from("settings type mismatch for fib action"))?
            .clone();

        match action_name {
            "add_route" => Ok(Box::new(AddRouteAction {
                module: self,
                settings,
            })),
            "replace_route" => Ok(Box::new(ReplaceRouteAction {
                module: self,
                settings,
            })),
            other => Err(ActionError(format!("no such fib action '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use crate::dispatch::Dispatcher;
    use crate::fib::FibError;

    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct FakeFib {
        route: Option<Route>,
    }

    impl FibInterface for FakeFib {
        fn get_routes(&self, _family: crate::route::AddressFamily) -> Result<Vec<Route>, FibError> {
            Ok(self.route.clone().into_iter().collect())
        }

        fn add_route(&self, _route: &Route) -> Result<(), FibError> {
            Ok(())
        }

        fn replace_route(&self, _route: &Route) -> Result<(), FibError> {
            Ok(())
        }

        fn get_default_routes(&self, _family: crate::route::AddressFamily) -> Result<Vec<Route>, FibError> {
            Ok(Vec::new())
        }

        fn get_route_to(&self, _rm: &RouteMatch) -> Result<Option<Route>, FibError> {
            Ok(self.route.clone())
        }
    }

    fn module(route: Option<Route>) -> FibModule {
        FibModule {
            settings: FibSettings { route_checks: Vec::new() },
            fib: Box::new(FakeFib { route }),
        }
    }

    fn check(dest: &str, non_null: bool, nexthops_any: Vec<IpAddr>) -> RouteCheckSettings {
        RouteCheckSettings {
            rm: RouteMatch::with_dest(net(dest)),
            non_null,
            nexthops_any,
            on_error: ActionListSettings::default(),
        }
    }

    #[test]
    fn route_check_ok_when_route_exists() {
        let route = Route::new(
            net("10.0.0.0/24"),
            vec![NextHop::new(Some(addr("10.0.0.1")), Some("eth0".into()))],
            None,
            "static".into(),
            RouteType::Unicast,
        );
        let m = module(Some(route));
        let dispatch = Dispatcher::empty();
        let status = m.do_route_check(&check("10.0.0.0/24", false, Vec::new()), &dispatch);
        assert_eq!(status, ModuleRunStatus::Ok);
    }

    #[test]
    fn route_check_fails_when_missing() {
        let m = module(None);
        let dispatch = Dispatcher::empty();
        let status = m.do_route_check(&check("10.0.0.0/24", false, Vec::new()), &dispatch);
        assert_eq!(status, ModuleRunStatus::CheckFailed);
    }

    #[test]
    fn route_check_fails_when_null_but_non_null_required() {
        let route = Route::new(
            net("10.0.0.0/24"),
            vec![NextHop::new(None, None)],
            None,
            "static".into(),
            RouteType::Blackhole,
        );
        let m = module(Some(route));
        let dispatch = Dispatcher::empty();
        let status = m.do_route_check(&check("10.0.0.0/24", true, Vec::new()), &dispatch);
        assert_eq!(status, ModuleRunStatus::CheckFailed);
    }

    #[test]
    fn route_check_fails_when_nexthop_not_in_allowed_set() {
        let route = Route::new(
            net("10.0.0.0/24"),
            vec![NextHop::new(Some(addr("10.0.0.9")), Some("eth0".into()))],
            None,
            "static".into(),
            RouteType::Unicast,
        );
        let m = module(Some(route));
        let dispatch = Dispatcher::empty();
        let status = m.do_route_check(&check("10.0.0.0/24", false, vec![addr("10.0.0.1")]), &dispatch);
        assert_eq!(status, ModuleRunStatus::CheckFailed);
    }
}
