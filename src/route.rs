//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Route data model: addresses, nexthops and routes, plus the
//! null-tolerant matching used by checks and FIB lookups.

use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// Address family of a route.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AddressFamily {
    Inet4,
    Inet6,
}

impl AddressFamily {
    /// Returns the address family matching the IP version of `addr`.
    pub fn of_addr(addr: IpAddr) -> AddressFamily {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet4,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    /// Returns the address family matching the IP version of `net`.
    pub fn of_network(net: IpNetwork) -> AddressFamily {
        match net {
            IpNetwork::V4(_) => AddressFamily::Inet4,
            IpNetwork::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn max_prefixlen(&self) -> u8 {
        match self {
            AddressFamily::Inet4 => 32,
            AddressFamily::Inet6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet4 => write!(f, "IPv4"),
            AddressFamily::Inet6 => write!(f, "IPv6"),
        }
    }
}

/// Kind of nexthop.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NhType {
    /// Directly attached, no gateway (e.g. an interface route).
    Connected,
    /// Routed through a gateway address.
    Via,
    /// Reserved: observable via "ip route get" but never produced by a
    /// plain route dump, so the Linux binding never constructs this.
    #[allow(dead_code)]
    Local,
}

/// Kernel route type, mirroring the `RTN_*` constants of `rtnetlink.h`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RouteType {
    Unspec,
    Unicast,
    Local,
    Broadcast,
    Anycast,
    Multicast,
    Blackhole,
    Unreachable,
    Prohibit,
    Throw,
    Nat,
    Xresolve,
}

impl RouteType {
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            RouteType::Blackhole | RouteType::Unreachable | RouteType::Prohibit
        )
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteType::Unspec => "unspec",
            RouteType::Unicast => "unicast",
            RouteType::Local => "local",
            RouteType::Broadcast => "broadcast",
            RouteType::Anycast => "anycast",
            RouteType::Multicast => "multicast",
            RouteType::Blackhole => "blackhole",
            RouteType::Unreachable => "unreachable",
            RouteType::Prohibit => "prohibit",
            RouteType::Throw => "throw",
            RouteType::Nat => "nat",
            RouteType::Xresolve => "xresolve",
        };
        write!(f, "{s}")
    }
}

/// A single nexthop within a route.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NextHop {
    pub gateway: Option<IpAddr>,
    pub ifname: Option<String>,
    pub kind: NhType,
}

impl NextHop {
    pub fn new(gateway: Option<IpAddr>, ifname: Option<String>) -> NextHop {
        let kind = if gateway.is_some() {
            NhType::Via
        } else {
            NhType::Connected
        };
        NextHop { gateway, ifname, kind }
    }

    /// Null-tolerant comparison: every field of `self` that is `Some`
    /// must equal the corresponding field of `other`; `None` fields
    /// match anything.
    pub fn matches(&self, other: &NextHop) -> bool {
        (self.gateway.is_none() || self.gateway == other.gateway)
            && (self.ifname.is_none() || self.ifname == other.ifname)
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ifname = self.ifname.as_deref().unwrap_or("?");
        match self.gateway {
            Some(gw) => write!(f, "via {gw} dev {ifname}"),
            None => write!(f, "dev {ifname}"),
        }
    }
}

/// Returns a short textual summary of a nexthop list's gateways, as used
/// in log and action-context messages.
pub fn nexthops_str(nexthops: &[NextHop]) -> String {
    match nexthops {
        [nh] => match nh.gateway {
            Some(gw) => gw.to_string(),
            None => "none".to_owned(),
        },
        nhs => {
            let gws: Vec<String> = nhs
                .iter()
                .map(|nh| match nh.gateway {
                    Some(gw) => gw.to_string(),
                    None => "none".to_owned(),
                })
                .collect();
            format!("[{}]", gws.join(", "))
        }
    }
}

/// Returns the prefix length of `dest` (its own prefix length if it
/// carries one, else 32/128 depending on IP version).
pub fn prefixlen_from_dest(dest: IpNetwork) -> u8 {
    dest.prefix()
}

/// Returns the canonical default network for a family (`0.0.0.0/0` or
/// `::/0`).
pub fn default_network(family: AddressFamily) -> IpNetwork {
    match family {
        AddressFamily::Inet4 => "0.0.0.0/0".parse().unwrap(),
        AddressFamily::Inet6 => "::/0".parse().unwrap(),
    }
}

/// A concrete route to a destination, possibly multipath.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub family: AddressFamily,
    pub dest: IpNetwork,
    pub destlen: u8,
    pub nexthops: Vec<NextHop>,
    pub metric: Option<u32>,
    pub proto: String,
    pub rt_type: RouteType,
}

impl Route {
    /// Builds a new Route, panicking if it has no nexthops. Only ever
    /// called with kernel-derived or action-supplied data that has
    /// already been validated at the config layer; never with
    /// unchecked user input.
    pub fn new(
        dest: IpNetwork,
        nexthops: Vec<NextHop>,
        metric: Option<u32>,
        proto: String,
        rt_type: RouteType,
    ) -> Route {
        let family = AddressFamily::of_network(dest);
        let destlen = prefixlen_from_dest(dest);
        assert!(!nexthops.is_empty(), "a route must have at least one nexthop");
        Route {
            family,
            dest,
            destlen,
            nexthops,
            metric,
            proto,
            rt_type,
        }
    }

    pub fn is_null(&self) -> bool {
        self.rt_type.is_null()
    }

    pub fn is_default(&self) -> bool {
        self.destlen == 0
    }

    pub fn multipath(&self) -> bool {
        self.nexthops.len() > 1
    }

    /// Extends this route's nexthop list with another route's nexthops,
    /// used when merging kernel messages that describe the same
    /// destination (IPv6 ECMP).
    pub fn add_nexthops(&mut self, mut nexthops: Vec<NextHop>) {
        self.nexthops.append(&mut nexthops);
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dest = if self.is_default() {
            "default".to_owned()
        } else {
            self.dest.to_string()
        };
        if self.multipath() {
            write!(f, "{} proto {}", dest, self.proto)?;
            for nh in &self.nexthops {
                write!(f, "\n\tnexthop {nh}")?;
            }
            Ok(())
        } else {
            write!(f, "{} {} proto {}", dest, self.nexthops[0], self.proto)
        }
    }
}

/// A relaxed Route used as a lookup/equality pattern: every field but
/// `family` may be absent, in which case it matches anything.
#[derive(Clone, Debug, Default)]
pub struct RouteMatch {
    pub dest: Option<IpNetwork>,
    pub nexthops: Vec<NextHop>,
    pub metric: Option<u32>,
    pub proto: Option<String>,
    pub rt_type: Option<RouteType>,
}

impl RouteMatch {
    pub fn with_dest(dest: IpNetwork) -> RouteMatch {
        RouteMatch {
            dest: Some(dest),
            ..Default::default()
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self.dest, Some(d) if d.prefix() == 0)
    }

    /// Null-tolerant comparison against a concrete route: every field of
    /// `self` that is present must equal the corresponding field of
    /// `concrete`.
    pub fn matches(&self, concrete: &Route) -> bool {
        if let Some(dest) = self.dest {
            if dest != concrete.dest {
                return false;
            }
        }
        if !self.nexthops.is_empty()
            && !self
                .nexthops
                .iter()
                .all(|nh| concrete.nexthops.iter().any(|cnh| nh.matches(cnh)))
        {
            return false;
        }
        if let Some(metric) = self.metric {
            if Some(metric) != concrete.metric {
                return false;
            }
        }
        if let Some(proto) = &self.proto {
            if proto != &concrete.proto {
                return false;
            }
        }
        if let Some(rt_type) = self.rt_type {
            if rt_type != concrete.rt_type {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn default_network_matches_family() {
        assert_eq!(default_network(AddressFamily::Inet4), net("0.0.0.0/0"));
        assert_eq!(default_network(AddressFamily::Inet6), net("::/0"));
    }

    #[test]
    fn route_match_dest_ignores_other_fields() {
        let r = Route::new(
            net("10.0.0.0/24"),
            vec![NextHop::new(Some(addr("10.0.0.1")), Some("eth0".into()))],
            Some(100),
            "static".into(),
            RouteType::Unicast,
        );
        let rm = RouteMatch::with_dest(net("10.0.0.0/24"));
        assert!(rm.matches(&r));
    }

    #[test]
    fn route_match_rejects_mismatched_dest() {
        let r = Route::new(
            net("10.0.0.0/24"),
            vec![NextHop::new(None, Some("eth0".into()))],
            None,
            "kernel".into(),
            RouteType::Unicast,
        );
        let rm = RouteMatch::with_dest(net("10.0.1.0/24"));
        assert!(!rm.matches(&r));
    }

    #[test]
    fn nexthop_matches_is_null_tolerant() {
        let pattern = NextHop {
            gateway: Some(addr("10.0.0.1")),
            ifname: None,
            kind: NhType::Via,
        };
        let concrete = NextHop::new(Some(addr("10.0.0.1")), Some("eth0".into()));
        assert!(pattern.matches(&concrete));
    }

    #[test]
    fn connected_nexthop_has_no_gateway() {
        let nh = NextHop::new(None, Some("lo".into()));
        assert_eq!(nh.kind, NhType::Connected);
    }
}
