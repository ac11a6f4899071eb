//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Linux FIB backend, talking to the kernel over rtnetlink.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use capctl::caps::CapState;
use futures::{StreamExt, TryStreamExt};
use ipnetwork::IpNetwork;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REPLACE, NLM_F_REQUEST};
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol,
    RouteType as NlRouteType,
};
use netlink_packet_route::{AddressFamily as NlAddressFamily, RouteNetlinkMessage};
use rtnetlink::{new_connection, Handle, RouteMessageBuilder};

use crate::fib::{FibError, FibInterface};
use crate::route::{self, AddressFamily, NextHop, Route, RouteMatch, RouteType};
use crate::rt::block_on;
use crate::rttable::RoutingTable;

/// Errno values the kernel returns instead of "no route" when asked to
/// resolve a destination that leads to a blackhole/unreachable/prohibit
/// entry. See ip-route(8) and linux/net/ipv4/fib_semantics.c:fib_props.
const LOOKUP_FALLBACK_ERRNOS: [i32; 4] = [
    -libc::ENETUNREACH,
    -libc::EHOSTUNREACH,
    -libc::EACCES,
    -libc::EINVAL,
];

pub struct LinuxFib {
    handle: Handle,
}

impl LinuxFib {
    /// Opens a netlink connection and serves it on a dedicated thread
    /// with permanently elevated capabilities.
    pub fn new() -> Result<LinuxFib, FibError> {
        let (conn, handle, _) = new_connection()
            .map_err(|e| FibError::op_with_cause("failed to open netlink socket", e))?;

        std::thread::spawn(|| {
            let mut caps = match CapState::get_current() {
                Ok(caps) => caps,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read current capabilities");
                    return;
                }
            };
            caps.effective = caps.permitted;
            if let Err(e) = caps.set_current() {
                tracing::error!(error = %e, "failed to update current capabilities");
            }
            futures::executor::block_on(conn);
        });

        Ok(LinuxFib { handle })
    }

    async fn dump(&self, family: AddressFamily) -> Result<Vec<Route>, FibError> {
        let message = match family {
            AddressFamily::Inet4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
            AddressFamily::Inet6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
        };
        let mut routes = self.handle.route().get(message).execute();
        let mut out = Vec::new();
        loop {
            match routes.try_next().await {
                Ok(Some(msg)) => {
                    if msg.header.table != RouteHeader::RT_TABLE_MAIN {
                        continue;
                    }
                    out.push(self.route_from_msg(&msg).await?);
                }
                Ok(None) => break,
                Err(e) => return Err(FibError::op_with_cause("failed to dump routes", e)),
            }
        }
        // IPv6 ECMP surfaces as separate messages to the same
        // destination; merge them back into one multipath route.
        Ok(RoutingTable::new(out).into_routes())
    }

    async fn route_from_msg(&self, msg: &RouteMessage) -> Result<Route, FibError> {
        let family = match msg.header.address_family {
            NlAddressFamily::Inet6 => AddressFamily::Inet6,
            _ => AddressFamily::Inet4,
        };
        let destlen = msg.header.destination_prefix_length;
        let dest = if destlen == 0 {
            route::default_network(family)
        } else {
            let dest_addr = msg.attributes.iter().find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
                RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
                _ => None,
            });
            let dest_addr = dest_addr
                .ok_or_else(|| FibError::op("route message has no destination attribute"))?;
            IpNetwork::new(dest_addr, destlen)
                .map_err(|e| FibError::op_with_cause("invalid destination prefix", e))?
        };

        let multipath = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::MultiPath(hops) => Some(hops),
            _ => None,
        });

        // Linux only sets RTA_MULTIPATH on IPv4; IPv6 ECMP shows up as
        // separate messages sharing a destination, merged later in
        // RoutingTable::new.
        let nexthops = match multipath {
            Some(hops) => {
                let mut nhs = Vec::with_capacity(hops.len());
                for hop in hops {
                    nhs.push(
                        self.nexthop_from_attrs(&hop.attributes, Some(hop.interface_index))
                            .await,
                    );
                }
                nhs
            }
            None => {
                let oif = msg.attributes.iter().find_map(|a| match a {
                    RouteAttribute::Oif(idx) => Some(*idx),
                    _ => None,
                });
                vec![self.nexthop_from_attrs(&msg.attributes, oif).await]
            }
        };

        let metric = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Priority(p) => Some(*p),
            _ => None,
        });

        let proto = proto_name(msg.header.protocol);
        let rt_type = rt_type_from_kind(msg.header.kind);

        Ok(Route::new(dest, nexthops, metric, proto, rt_type))
    }

    async fn nexthop_from_attrs(&self, attrs: &[RouteAttribute], oif: Option<u32>) -> NextHop {
        let gateway = attrs.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        let ifname = match oif {
            Some(idx) => self.get_ifname(idx).await,
            None => None,
        };
        NextHop::new(gateway, ifname)
    }

    async fn get_ifname(&self, index: u32) -> Option<String> {
        let mut links = self.handle.link().get().match_index(index).execute();
        let msg = links.try_next().await.ok()??;
        msg.attributes.into_iter().find_map(|a| match a {
            LinkAttribute::IfName(name) => Some(name),
            _ => None,
        })
    }

    async fn get_ifindex(&self, name: &str) -> Option<u32> {
        let mut links = self.handle.link().get().match_name(name.to_owned()).execute();
        let msg = links.try_next().await.ok()??;
        Some(msg.header.index)
    }

    async fn install_add(&self, r: &Route) -> Result<(), FibError> {
        match r.dest {
            IpNetwork::V4(dest) => {
                let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
                    .destination_prefix(dest.ip(), dest.prefix());
                for nh in &r.nexthops {
                    if let Some(IpAddr::V4(gw)) = nh.gateway {
                        builder = builder.gateway(gw);
                    }
                    if let Some(ifname) = &nh.ifname {
                        if let Some(idx) = self.get_ifindex(ifname).await {
                            builder = builder.output_interface(idx);
                        }
                    }
                }
                self.handle
                    .route()
                    .add(builder.build())
                    .execute()
                    .await
                    .map_err(|e| FibError::op_with_cause("failed to add route", e))
            }
            IpNetwork::V6(dest) => {
                let mut builder = RouteMessageBuilder::<Ipv6Addr>::new()
                    .destination_prefix(dest.ip(), dest.prefix());
                for nh in &r.nexthops {
                    if let Some(IpAddr::V6(gw)) = nh.gateway {
                        builder = builder.gateway(gw);
                    }
                    if let Some(ifname) = &nh.ifname {
                        if let Some(idx) = self.get_ifindex(ifname).await {
                            builder = builder.output_interface(idx);
                        }
                    }
                }
                self.handle
                    .route()
                    .add(builder.build())
                    .execute()
                    .await
                    .map_err(|e| FibError::op_with_cause("failed to add route", e))
            }
        }
    }

    async fn install_replace(&self, r: &Route) -> Result<(), FibError> {
        match r.dest {
            IpNetwork::V4(dest) => {
                let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
                    .destination_prefix(dest.ip(), dest.prefix());
                for nh in &r.nexthops {
                    if let Some(IpAddr::V4(gw)) = nh.gateway {
                        builder = builder.gateway(gw);
                    }
                    if let Some(ifname) = &nh.ifname {
                        if let Some(idx) = self.get_ifindex(ifname).await {
                            builder = builder.output_interface(idx);
                        }
                    }
                }
                self.handle
                    .route()
                    .add(builder.build())
                    .replace()
                    .execute()
                    .await
                    .map_err(|e| FibError::op_with_cause("failed to replace route", e))
            }
            IpNetwork::V6(dest) => {
                let mut builder = RouteMessageBuilder::<Ipv6Addr>::new()
                    .destination_prefix(dest.ip(), dest.prefix());
                for nh in &r.nexthops {
                    if let Some(IpAddr::V6(gw)) = nh.gateway {
                        builder = builder.gateway(gw);
                    }
                    if let Some(ifname) = &nh.ifname {
                        if let Some(idx) = self.get_ifindex(ifname).await {
                            builder = builder.output_interface(idx);
                        }
                    }
                }
                self.handle
                    .route()
                    .add(builder.build())
                    .replace()
                    .execute()
                    .await
                    .map_err(|e| FibError::op_with_cause("failed to replace route", e))
            }
        }
    }

    /// Builds the `RTM_NEWROUTE`/`RTM_DELROUTE` message body shared by
    /// `install_change` and `install_delete`: destination prefix plus the
    /// first nexthop's gateway/output interface, same fields `install_add`
    /// and `install_replace` set through the high-level builder.
    async fn route_message_for(&self, r: &Route) -> RouteMessage {
        let mut message = match r.dest {
            IpNetwork::V4(dest) => RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(dest.ip(), dest.prefix())
                .build(),
            IpNetwork::V6(dest) => RouteMessageBuilder::<Ipv6Addr>::new()
                .destination_prefix(dest.ip(), dest.prefix())
                .build(),
        };
        if let Some(nh) = r.nexthops.first() {
            if let Some(gw) = nh.gateway {
                message.attributes.push(RouteAttribute::Gateway(match gw {
                    IpAddr::V4(ip) => RouteAddress::Inet(ip),
                    IpAddr::V6(ip) => RouteAddress::Inet6(ip),
                }));
            }
            if let Some(ifname) = &nh.ifname {
                if let Some(idx) = self.get_ifindex(ifname).await {
                    message.attributes.push(RouteAttribute::Oif(idx));
                }
            }
        }
        message
    }

    /// Changes an existing route in place. Unlike `install_replace`, this
    /// must fail if no matching route exists, which the `rtnetlink` crate's
    /// `RouteAddRequest` builder has no convenience method for (its
    /// `.replace()` always also sets `NLM_F_CREATE`, giving upsert
    /// semantics). Sent as a raw `RTM_NEWROUTE` request with `NLM_F_REPLACE`
    /// and no `NLM_F_CREATE`, so the kernel rejects it if the route is
    /// missing instead of creating it.
    async fn install_change(&self, r: &Route) -> Result<(), FibError> {
        let message = self.route_message_for(r).await;
        let mut request = NetlinkMessage::from(RouteNetlinkMessage::NewRoute(message));
        request.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE;

        let mut response = self
            .handle
            .clone()
            .request(request)
            .map_err(|e| FibError::op_with_cause("failed to change route", e))?;
        while let Some(msg) = response.next().await {
            if let NetlinkPayload::Error(err) = msg.payload {
                return Err(FibError::op_with_cause("failed to change route", format!("{err:?}")));
            }
        }
        Ok(())
    }

    /// Deletes a route. A plain `RTM_DELROUTE` call, carrying neither
    /// `NLM_F_CREATE` nor `NLM_F_REPLACE`.
    async fn install_delete(&self, r: &Route) -> Result<(), FibError> {
        let message = self.route_message_for(r).await;
        self.handle
            .route()
            .del(message)
            .execute()
            .await
            .map_err(|e| FibError::op_with_cause("failed to delete route", e))
    }

    async fn matching_routes_to_async(&self, dest: IpNetwork) -> Result<Vec<Route>, FibError> {
        let family = AddressFamily::of_network(dest);
        let mut routes = self.dump(family).await?;
        let destlen = dest.prefix();
        routes.retain(|r| {
            r.destlen == 0 || (r.destlen <= destlen && net_contains(r.dest, dest))
        });
        routes.sort_by(|a, b| b.destlen.cmp(&a.destlen));
        Ok(routes)
    }

    async fn get_default_routes_async(&self, family: AddressFamily) -> Result<Vec<Route>, FibError> {
        let routes = self.dump(family).await?;
        Ok(routes.into_iter().filter(|r| r.destlen == 0).collect())
    }

    async fn get_route_to_async(&self, rm: &RouteMatch) -> Result<Option<Route>, FibError> {
        let dest = rm
            .dest
            .ok_or_else(|| FibError::op("route lookup requires a destination"))?;
        let family = AddressFamily::of_network(dest);

        if rm.is_default() {
            // Netlink's "get" doesn't resolve the default route itself;
            // ask for it directly instead.
            let defaults = self.get_default_routes_async(family).await?;
            return Ok(defaults.into_iter().next());
        }

        let message = match dest.ip() {
            IpAddr::V4(ip) => RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(ip, 32)
                .build(),
            IpAddr::V6(ip) => RouteMessageBuilder::<Ipv6Addr>::new()
                .destination_prefix(ip, 128)
                .build(),
        };

        match self.handle.route().get(message).execute().try_next().await {
            Ok(Some(msg)) => Ok(Some(self.route_from_msg(&msg).await?)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(err))
                if LOOKUP_FALLBACK_ERRNOS.contains(&err.raw_code()) =>
            {
                // Blackhole, unreachable and prohibited routes error out
                // on lookup instead of resolving; fall back to a
                // userspace longest-prefix search over the dumped table.
                let routes = self.matching_routes_to_async(dest).await?;
                Ok(routes.into_iter().next())
            }
            Err(e) => Err(FibError::op_with_cause("failed to look up route", e)),
        }
    }
}

fn net_contains(outer: IpNetwork, inner: IpNetwork) -> bool {
    outer == inner || outer.contains(inner.ip())
}

fn proto_name(proto: RouteProtocol) -> String {
    match proto {
        RouteProtocol::Unspec => "none".to_owned(),
        RouteProtocol::IcmpRedirect => "redirect".to_owned(),
        RouteProtocol::Kernel => "kernel".to_owned(),
        RouteProtocol::Boot => "boot".to_owned(),
        RouteProtocol::Static => "static".to_owned(),
        other => format!("{other:?}").to_lowercase(),
    }
}

fn rt_type_from_kind(kind: NlRouteType) -> RouteType {
    match kind {
        NlRouteType::Unicast => RouteType::Unicast,
        NlRouteType::Local => RouteType::Local,
        NlRouteType::Broadcast => RouteType::Broadcast,
        NlRouteType::Anycast => RouteType::Anycast,
        NlRouteType::Multicast => RouteType::Multicast,
        NlRouteType::BlackHole => RouteType::Blackhole,
        NlRouteType::Unreachable => RouteType::Unreachable,
        NlRouteType::Prohibit => RouteType::Prohibit,
        NlRouteType::Throw => RouteType::Throw,
        NlRouteType::Nat => RouteType::Nat,
        _ => RouteType::Unspec,
    }
}

impl FibInterface for LinuxFib {
    fn get_routes(&self, family: AddressFamily) -> Result<Vec<Route>, FibError> {
        block_on(self.dump(family))
    }

    fn add_route(&self, route: &Route) -> Result<(), FibError> {
        block_on(self.install_add(route))
    }

    fn replace_route(&self, route: &Route) -> Result<(), FibError> {
        block_on(self.install_replace(route))
    }

    fn change_route(&self, route: &Route) -> Result<(), FibError> {
        block_on(self.install_change(route))
    }

    fn delete_route(&self, route: &Route) -> Result<(), FibError> {
        block_on(self.install_delete(route))
    }

    fn get_default_routes(&self, family: AddressFamily) -> Result<Vec<Route>, FibError> {
        block_on(self.get_default_routes_async(family))
    }

    fn get_route_to(&self, rm: &RouteMatch) -> Result<Option<Route>, FibError> {
        block_on(self.get_route_to_async(rm))
    }
}
