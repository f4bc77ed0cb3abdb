//! docwire-ping: connect to a server or replica set and print what was found

use clap::{Arg, ArgAction, ArgMatches, Command};
use docwire::connection::ValidationMode;
use docwire::{Client, ClientOptions};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn command() -> Command {
    Command::new("docwire-ping")
        .about("Connect to a document database endpoint and report its topology")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("uri")
                .env("DOCWIRE_URI")
                .help("mongodb://host[:port][,host[:port]...]/[database][?options]")
                .long("uri")
                .short('u')
                .required(true),
        )
        .arg(
            Arg::new("ca")
                .env("DOCWIRE_CA")
                .help("CA bundle used to verify the server certificate")
                .long("ca")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("cert")
                .env("DOCWIRE_CERT")
                .help("Client certificate (may also contain the key)")
                .long("cert")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("key")
                .env("DOCWIRE_KEY")
                .help("Client private key")
                .long("key")
                .value_name("PATH")
                .requires("cert"),
        )
        .arg(
            Arg::new("pass")
                .env("DOCWIRE_PASS")
                .help("Passphrase for an encrypted client key")
                .long("pass")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("mode")
                .env("DOCWIRE_VALIDATION")
                .help("Certificate validation mode")
                .long("mode")
                .value_name("MODE")
                .value_parser(["skip", "validate-ca", "validate-ca-and-hostname"])
                .conflicts_with("insecure"),
        )
        .arg(
            Arg::new("insecure")
                .help("Skip certificate validation (same as --mode skip)")
                .long("insecure")
                .short('k')
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .default_value("10000")
                .env("DOCWIRE_TIMEOUT_MS")
                .help("Connect and server selection timeout in milliseconds")
                .long("timeout")
                .short('t')
                .value_parser(clap::value_parser!(u64)),
        )
}

fn client_options(matches: &ArgMatches) -> docwire::Result<ClientOptions> {
    let timeout = Duration::from_millis(matches.get_one::<u64>("timeout").copied().unwrap_or(10_000));
    let mut builder = ClientOptions::builder()
        .connect_timeout(timeout)
        .server_selection_timeout(timeout);

    if let Some(ca) = matches.get_one::<String>("ca") {
        builder = builder.ssl_ca_path(ca);
    }
    if let Some(cert) = matches.get_one::<String>("cert") {
        builder = builder.ssl_cert_path(cert);
    }
    if let Some(key) = matches.get_one::<String>("key") {
        builder = builder.ssl_key_path(key);
    }
    if let Some(pass) = matches.get_one::<String>("pass") {
        builder = builder.ssl_pass(pass.as_str());
    }
    if matches.get_flag("insecure") {
        builder = builder.validation(ValidationMode::Skip);
    } else if let Some(mode) = matches.get_one::<String>("mode") {
        builder = builder.validation(mode.parse()?);
    }
    Ok(builder.build())
}

async fn run(matches: ArgMatches) -> docwire::Result<()> {
    let uri = matches
        .get_one::<String>("uri")
        .ok_or_else(|| docwire::Error::Config("missing --uri".into()))?;
    let client = Client::connect(uri, client_options(&matches)?).await?;

    println!("validation: {}", client.mode());
    match client.topology() {
        Some(monitor) => {
            let snapshot = monitor.snapshot();
            if let Some(set_name) = snapshot.set_name() {
                println!("replica set: {}", set_name);
            }
            for server in snapshot.servers() {
                let rtt = server
                    .round_trip_time
                    .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
                    .unwrap_or_else(|| "-".into());
                match &server.error {
                    Some(e) => println!("  {:<28} {:<12} {:>8}  {}", server.endpoint, server.role, rtt, e),
                    None => println!("  {:<28} {:<12} {:>8}", server.endpoint, server.role, rtt),
                }
            }
        }
        None => {
            let status = client.status().await?;
            let role = if status.is_primary { "primary" } else { "secondary" };
            println!("standalone: {} ({})", client.hosts()[0], role);
        }
    }

    if let Some(endpoint) = client.current_primary() {
        let conn = client.acquire_from(&endpoint).await?;
        if let Some(peer) = conn.peer_identity() {
            println!("primary certificate: {}", peer.subject);
            println!("  sha256 {}", peer.fingerprint);
        }
    }

    client.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let matches = command().get_matches();
    match run(matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("docwire-ping: {}", e);
            ExitCode::FAILURE
        }
    }
}
