//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Longest-prefix-match route store and the routing table built on top
//! of it.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::route::Route;

/// Ternary-CAM-style lookup structure: routes indexed first by prefix
/// length, then by destination network within that length.
#[derive(Debug, Default)]
pub struct Tcam {
    by_len: BTreeMap<u8, HashMap<IpNetwork, Route>>,
}

impl Tcam {
    pub fn new() -> Tcam {
        Tcam::default()
    }

    pub fn add(&mut self, r: Route) {
        self.by_len.entry(r.destlen).or_default().insert(r.dest, r);
    }

    /// Removes the route matching `r`'s destination. `r` is compared
    /// against the stored route with `r`'s own equality so that callers
    /// can pass a partially-specified route; returns `true` if a route
    /// was removed, `false` if no route exists for that destination or
    /// the stored route differs from `r`.
    pub fn remove(&mut self, r: &Route) -> bool {
        let Some(routes_by_dest) = self.by_len.get_mut(&r.destlen) else {
            return false;
        };
        match routes_by_dest.get(&r.dest) {
            Some(existing) if existing == r => {
                routes_by_dest.remove(&r.dest);
                if routes_by_dest.is_empty() {
                    self.by_len.remove(&r.destlen);
                }
                true
            }
            _ => false,
        }
    }

    pub fn get_exact(&self, dest: IpNetwork) -> Option<&Route> {
        self.by_len.get(&dest.prefix())?.get(&dest)
    }

    /// Longest-prefix match for `dest`, which may be a bare address
    /// (matched at its family's full width) or a network (matched only
    /// against prefixes no longer than its own).
    pub fn longest_match(&self, dest: IpAddr) -> Option<&Route> {
        self.longest_match_len(dest, dest.max_prefixlen())
    }

    pub fn longest_match_len(&self, ip: IpAddr, max_len: u8) -> Option<&Route> {
        for (&len, routes_by_dest) in self.by_len.range(..=max_len).rev() {
            let truncated = IpNetwork::new(ip, len).ok()?.network();
            let key = IpNetwork::new(truncated, len).ok()?;
            if let Some(r) = routes_by_dest.get(&key) {
                return Some(r);
            }
        }
        None
    }
}

trait MaxPrefixLen {
    fn max_prefixlen(&self) -> u8;
}

impl MaxPrefixLen for IpAddr {
    fn max_prefixlen(&self) -> u8 {
        match self {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

/// A snapshot of the FIB: a TCAM for lookups plus the original
/// insertion order, with same-destination routes merged (the mechanism
/// by which IPv6 ECMP, which the kernel surfaces as separate messages
/// to the same destination, is reassembled into one multipath route).
#[derive(Debug, Default)]
pub struct RoutingTable {
    tcam: Tcam,
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new(routes: impl IntoIterator<Item = Route>) -> RoutingTable {
        let mut table = RoutingTable::default();
        for r in routes {
            match table.tcam.get_exact(r.dest) {
                Some(existing) if existing.destlen == r.destlen => {
                    // Merge into the already-stored route's nexthops.
                    let dest = r.dest;
                    let nexthops = r.nexthops;
                    table.merge_nexthops(dest, nexthops);
                }
                _ => {
                    table.routes.push(r.clone());
                    table.tcam.add(r);
                }
            }
        }
        table
    }

    fn merge_nexthops(&mut self, dest: IpNetwork, nexthops: Vec<crate::route::NextHop>) {
        for r in self.routes.iter_mut() {
            if r.dest == dest {
                r.add_nexthops(nexthops);
                break;
            }
        }
        // Keep the TCAM's copy in sync with the merged route.
        if let Some(r) = self.routes.iter().find(|r| r.dest == dest) {
            self.tcam.add(r.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn into_routes(self) -> Vec<Route> {
        self.routes
    }

    pub fn get_route_for(&self, dest: IpAddr) -> Option<&Route> {
        self.tcam.longest_match(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{NextHop, RouteType};

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn route(dest: &str, gw: &str) -> Route {
        Route::new(
            net(dest),
            vec![NextHop::new(Some(addr(gw)), Some("eth0".into()))],
            None,
            "static".into(),
            RouteType::Unicast,
        )
    }

    #[test]
    fn exact_lookup_after_insert() {
        let mut tcam = Tcam::new();
        let r = route("10.0.0.0/24", "10.0.0.1");
        tcam.add(r.clone());
        assert_eq!(tcam.get_exact(net("10.0.0.0/24")), Some(&r));
    }

    #[test]
    fn longest_match_prefers_more_specific() {
        let mut tcam = Tcam::new();
        tcam.add(route("10.0.0.0/8", "10.0.0.1"));
        tcam.add(route("10.0.0.0/24", "10.0.0.2"));
        let hit = tcam.longest_match(addr("10.0.0.5")).unwrap();
        assert_eq!(hit.dest, net("10.0.0.0/24"));
    }

    #[test]
    fn longest_match_falls_back_to_less_specific() {
        let mut tcam = Tcam::new();
        tcam.add(route("10.0.0.0/8", "10.0.0.1"));
        let hit = tcam.longest_match(addr("10.1.2.3")).unwrap();
        assert_eq!(hit.dest, net("10.0.0.0/8"));
    }

    #[test]
    fn remove_then_get_exact_is_none() {
        let mut tcam = Tcam::new();
        let r = route("10.0.0.0/24", "10.0.0.1");
        tcam.add(r.clone());
        assert!(tcam.remove(&r));
        assert_eq!(tcam.get_exact(net("10.0.0.0/24")), None);
    }

    #[test]
    fn routing_table_merges_same_destination() {
        let r1 = route("2001:db8::/32", "2001:db8::1");
        let r2 = route("2001:db8::/32", "2001:db8::2");
        let table = RoutingTable::new(vec![r1, r2]);
        let merged = table.iter().next().unwrap();
        assert_eq!(merged.nexthops.len(), 2);
        assert!(merged.multipath());
    }
}
