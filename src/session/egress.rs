//! Outbound RIB-out (spec.md §4.2, steady-state data flow "table export ->
//! RibOut batching -> encoder -> session writer -> outbound bytes").
//!
//! Grounded in the teacher's `session/session.rs` `Session::create_update`
//! (well-known attributes first, MP_REACH_NLRI for IPv6, eBGP AS-path
//! prepend) run in reverse of `session::ingest::decode_attrs`. Registered
//! as a `RouteListener` on an instance's `Inet`/`Inet6` table, one per
//! (instance, family) pair — VPN/EVPN/multicast families never reach a
//! wire peer directly (spec.md §4.3/§4.4), so this only ever sees the two
//! families a `Peer` can actually negotiate.
use std::net::IpAddr;
use std::sync::Arc;

use bgp_rs::{ASPath, Message, MPReachNLRI, MPUnreachNLRI, NLRIEncoding, PathAttribute, Update, AFI, SAFI};
use log::warn;

use crate::attr::{AsPathSpec, AttrDb, AttrValue};
use crate::export::{export_best, ExportContext};
use crate::route::{AddressFamily, Path, RouteKey};
use crate::table::RouteListener;
use crate::utils::prefix_from_network;

use super::manager::SessionManager;

/// Fans a table's best-path notifications out to every established peer
/// in `instance` that negotiated `family`, as real outbound wire messages.
pub struct RibOut {
    sessions: Arc<SessionManager>,
    attr_db: Arc<AttrDb>,
    instance: String,
    family: AddressFamily,
}

impl RibOut {
    pub fn new(sessions: Arc<SessionManager>, attr_db: Arc<AttrDb>, instance: impl Into<String>, family: AddressFamily) -> Arc<Self> {
        Arc::new(Self { sessions, attr_db, instance: instance.into(), family })
    }
}

impl RouteListener for RibOut {
    fn on_route_changed(&self, family: AddressFamily, key: &RouteKey, best: Option<&Path>) {
        if family != self.family {
            return;
        }
        let network = match key {
            RouteKey::Inet(net) | RouteKey::Inet6(net) => *net,
            _ => return, // only wire-negotiable families ever reach this listener
        };
        let sessions = self.sessions.clone();
        let db = self.attr_db.clone();
        let instance = self.instance.clone();
        let best = best.cloned();
        tokio::spawn(async move {
            let targets = sessions.export_targets(&instance, family).await;
            for (peer_id, is_ebgp, handle) in targets {
                let ctx = ExportContext { destination_peer_id: Some(peer_id), is_bgp_peer: true, keep_ext_communities: false };
                let message = match &best {
                    Some(path) => match export_best(&ctx, &db, path) {
                        Some(update) => {
                            let local_as = { handle.lock().await.config.local_as };
                            build_announce(&network, &update.attr, is_ebgp, local_as)
                        }
                        None => continue, // split horizon: nothing changed for this peer
                    },
                    None => build_withdraw(&network),
                };
                let mut peer = handle.lock().await;
                if let Err(err) = peer.send_message(message).await {
                    warn!("rib-out to peer {} failed: {}", peer_id, err);
                }
            }
        });
    }
}

fn build_announce(network: &ipnetwork::IpNetwork, attr: &AttrValue, is_ebgp: bool, local_as: u32) -> Message {
    let prefix = prefix_from_network(network);
    let mut attributes = Vec::with_capacity(6);
    attributes.push(PathAttribute::ORIGIN(attr.origin.clone()));
    if let (AFI::IPV4, IpAddr::V4(next_hop)) = (prefix.protocol, attr.next_hop) {
        attributes.push(PathAttribute::NEXT_HOP(next_hop));
    }

    let spec: AsPathSpec = (*attr.as_path).clone();
    let spec = if is_ebgp { spec.prepend(local_as) } else { spec };
    attributes.push(PathAttribute::AS_PATH(ASPath::from(&spec)));

    attributes.push(PathAttribute::LOCAL_PREF(attr.local_pref));
    if let Some(med) = attr.med {
        attributes.push(PathAttribute::MULTI_EXIT_DISC(med));
    }
    if attr.atomic_aggregate {
        attributes.push(PathAttribute::ATOMIC_AGGREGATOR);
    }
    if let Some((asn, IpAddr::V4(addr))) = attr.aggregator {
        attributes.push(PathAttribute::AGGREGATOR((asn, addr)));
    }
    let standard: Vec<u32> = attr.communities.standard.iter().map(|c| c.0).collect();
    if !standard.is_empty() {
        attributes.push(PathAttribute::COMMUNITY(standard));
    }
    let extended: Vec<u64> = attr.communities.extended.iter().map(|c| c.0).collect();
    if !extended.is_empty() {
        attributes.push(PathAttribute::EXTENDED_COMMUNITIES(extended));
    }
    if let Some(IpAddr::V4(id)) = attr.originator_id {
        attributes.push(PathAttribute::ORIGINATOR_ID(u32::from(id)));
    }
    if !attr.cluster_list.is_empty() {
        attributes.push(PathAttribute::CLUSTER_LIST(attr.cluster_list.clone()));
    }

    let mut update = Update { withdrawn_routes: Vec::new(), attributes, announced_routes: Vec::new() };
    match prefix.protocol {
        AFI::IPV4 => update.announced_routes.push(NLRIEncoding::IP(prefix)),
        AFI::IPV6 => {
            let next_hop = match attr.next_hop {
                IpAddr::V6(v6) => v6.octets().to_vec(),
                IpAddr::V4(_) => Vec::new(), // unreachable in practice: table/next-hop families agree
            };
            update.attributes.push(PathAttribute::MP_REACH_NLRI(MPReachNLRI {
                afi: AFI::IPV6,
                safi: SAFI::Unicast,
                next_hop,
                announced_routes: vec![NLRIEncoding::IP(prefix)],
            }));
        }
        _ => {}
    }
    Message::Update(update)
}

fn build_withdraw(network: &ipnetwork::IpNetwork) -> Message {
    let prefix = prefix_from_network(network);
    match prefix.protocol {
        AFI::IPV4 => Message::Update(Update {
            withdrawn_routes: vec![NLRIEncoding::IP(prefix)],
            attributes: Vec::new(),
            announced_routes: Vec::new(),
        }),
        _ => Message::Update(Update {
            withdrawn_routes: Vec::new(),
            attributes: vec![PathAttribute::MP_UNREACH_NLRI(MPUnreachNLRI {
                afi: prefix.protocol,
                safi: SAFI::Unicast,
                withdrawn_routes: vec![NLRIEncoding::IP(prefix)],
            })],
            announced_routes: Vec::new(),
        }),
    }
}
