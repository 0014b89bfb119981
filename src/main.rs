use std::io;

use env_logger::Builder;
use log::{debug, info, LevelFilter};

use bgpd::ServerConfig;

fn verbosity_levels(occurrences: u8) -> (LevelFilter, LevelFilter) {
    match occurrences {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    }
}

async fn run(config_path: String, address: std::net::IpAddr, port: u16, verbose: u8) -> io::Result<()> {
    let (bgpd_level, other_level) = verbosity_levels(verbose);
    Builder::new().filter(Some("bgpd"), bgpd_level).filter(None, other_level).init();
    info!("Logging at levels {}/{}", bgpd_level, other_level);

    let config = ServerConfig::from_file(&config_path).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    debug!("Found {} neighbors in {}", config.neighbors.len(), config_path);

    bgpd::serve(address, port, config).await
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> io::Result<()> {
    use bgpd::cli::{query_bgpd, Args, Command};
    use clap::Parser;

    let args = Args::parse();
    match &args.cmd {
        Command::Run { config_path, address, port, verbose } => run(config_path.clone(), *address, *port, *verbose).await,
        _ => {
            query_bgpd(&args).await;
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
#[tokio::main]
async fn main() -> io::Result<()> {
    use clap::{App, Arg};

    let matches = App::new("bgpd")
        .version("0.1")
        .author("Mat W. <mat@thepacketgeek.com>")
        .about("BGP Server")
        .arg(Arg::with_name("configpath").help("Path to bgpd server config").takes_value(true).index(1).required(true))
        .arg(Arg::with_name("address").short("a").long("address").help("IP Address to listen on").takes_value(true))
        .arg(Arg::with_name("port").short("p").long("port").takes_value(true).help("TCP Port to listen on"))
        .arg(Arg::with_name("v").short("v").multiple(true).help("Sets the level of logging verbosity"))
        .get_matches();

    let config_path: String = matches.value_of("configpath").unwrap().parse().expect("Must specify a valid config path");
    let address: std::net::IpAddr = matches.value_of("address").unwrap_or("0.0.0.0").parse().expect("Must specify a valid IP Address");
    let port: u16 = matches.value_of("port").unwrap_or("179").parse().expect("Port must be an integer");
    let verbose = matches.occurrences_of("v") as u8;

    run(config_path, address, port, verbose).await
}
