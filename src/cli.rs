//! Thin CLI front door (SPEC_FULL.md §1: "no standalone CLI distribution
//! beyond the thin front door required to exercise the crate"): run the
//! daemon, or query a running one's `ShowApi` over HTTP and print a table.
//!
//! Grounded in the teacher's `cli/mod.rs` (`clap::Parser` derive, a
//! `jsonrpsee` `HttpClientBuilder` pointed at `--host`/`--port`, results
//! rendered with `prettytable-rs`), pared down to this crate's read-only
//! `ShowApi` surface — the teacher's `advertise`/`advertise flow` mutating
//! commands have no counterpart here.
use std::error::Error;
use std::net::IpAddr;

use clap::Parser;
use colored::Colorize;
use jsonrpsee::http_client::HttpClientBuilder;
use prettytable::{row, Table as PrettyTable};

use crate::api::rpc::{InstanceSummary, PeerSummary, RouteSummary, ShowApiClient};

#[derive(Parser, Debug)]
#[clap(name = "bgpd", rename_all = "kebab-case")]
pub struct Args {
    #[clap(subcommand)]
    pub cmd: Command,
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,
    #[clap(short, long, default_value_t = 8080)]
    pub port: u16,
}

#[derive(Parser, Debug)]
#[clap(rename_all = "kebab-case")]
pub enum Command {
    /// Run the bgpd daemon against a config file.
    Run {
        config_path: String,
        /// IP Address for the BGP listener to bind.
        #[clap(short, long, default_value = "0.0.0.0")]
        address: IpAddr,
        /// TCP port for the BGP listener to bind.
        #[clap(short, long, default_value_t = 179)]
        port: u16,
        /// Logging verbosity; repeat for more (-v, -vv, -vvv).
        #[clap(short, parse(from_occurrences))]
        verbose: u8,
    },
    /// View configured peers and their session state.
    #[clap(alias = "peers")]
    ShowPeers,
    /// View a single peer's negotiated details.
    ShowPeerDetail { peer_address: IpAddr },
    /// View configured routing instances and per-family route counts.
    ShowInstances,
    /// View a table's best-path routes.
    ShowRoutes { instance: String, family: String },
}

async fn run_query(args: &Args) -> Result<(), Box<dyn Error>> {
    let base = format!("http://{}:{}", args.host, args.port);
    let client = HttpClientBuilder::default().build(base)?;
    match &args.cmd {
        Command::ShowPeers => print_peers(client.show_peers().await?),
        Command::ShowPeerDetail { peer_address } => match client.show_peer_detail(*peer_address).await? {
            Some(detail) => print_peers(vec![detail.summary]),
            None => println!("no such peer {}", peer_address),
        },
        Command::ShowInstances => print_instances(client.show_instances().await?),
        Command::ShowRoutes { instance, family } => print_routes(client.show_routes(instance.clone(), family.clone()).await?),
        Command::Run { .. } => unreachable!("Run is handled in main before this path is taken"),
    }
    Ok(())
}

fn print_peers(peers: Vec<PeerSummary>) {
    let mut table = PrettyTable::new();
    table.add_row(row!["Peer", "Instance", "Local AS", "Peer AS", "State", "MsgRcvd", "MsgSent"]);
    for peer in peers {
        let state = if peer.state == "Established" { peer.state.green().to_string() } else { peer.state };
        table.add_row(row![
            peer.peer_address,
            peer.instance,
            peer.local_as,
            peer.peer_as,
            state,
            peer.msg_received,
            peer.msg_sent
        ]);
    }
    table.printstd();
}

fn print_instances(instances: Vec<InstanceSummary>) {
    let mut table = PrettyTable::new();
    table.add_row(row!["Instance", "Families", "Route counts"]);
    for instance in instances {
        let counts = instance.route_counts.iter().map(|(f, n)| format!("{}={}", f, n)).collect::<Vec<_>>().join(", ");
        table.add_row(row![instance.name, instance.families.join(", "), counts]);
    }
    table.printstd();
}

fn print_routes(routes: Vec<RouteSummary>) {
    let mut table = PrettyTable::new();
    table.add_row(row!["Prefix", "Next Hop", "Origin", "AS Path", "Local Pref", "MED", "Source", "Peer"]);
    for route in routes {
        table.add_row(row![
            route.prefix,
            route.next_hop,
            route.origin,
            route.as_path,
            route.local_pref,
            route.med.map(|m| m.to_string()).unwrap_or_default(),
            route.source,
            route.peer.map(|p| p.to_string()).unwrap_or_default()
        ]);
    }
    table.printstd();
}

/// Run every non-`Run` subcommand against a live daemon, printing errors in
/// red the way the teacher's `query_bgpd` does rather than propagating them.
pub async fn query_bgpd(args: &Args) {
    if let Err(err) = run_query(args).await {
        eprintln!("{}", err.to_string().red());
    }
}
