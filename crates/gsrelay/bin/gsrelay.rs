use std::{io, net::Ipv4Addr, net::SocketAddr, path::PathBuf, process, sync::Mutex};

use clap::Parser;
use gsrelay::{Config, Relay, Role, daemon, tty};
use gsrelay_transport::tcp::TcpGs;
use tracing::error;
use tracing_subscriber::EnvFilter;

const MANUAL: &str = "\
GSRELAY(1)

NAME
    gsrelay - relay TCP, shells and SOCKS between NAT'd peers

SYNOPSIS
    gsrelay -l [-S] [-r] [-e cmd] [-d ip] [-p port] -g addr
    gsrelay [-i] [-r] [-p port] -g addr

DESCRIPTION
    One side runs with -l and waits at the rendezvous point; the other
    side connects to the same point. Paired peers relay traffic between
    the rendezvous transport and a local sink: a spawned command (-e),
    a fixed TCP destination (-d/-p), a SOCKS server (-S), or stdio.

EXAMPLES
    Forward local port 2222 to 192.168.6.7:22 behind the server:
        gsrelay -l -d 192.168.6.7 -p 22 -g rendezvous:2000
        gsrelay -p 2222 -g rendezvous:2000
    Reverse shell:
        gsrelay -l -e /bin/sh -g rendezvous:2000
        gsrelay -g rendezvous:2000
    SOCKS proxy:
        gsrelay -l -S -g rendezvous:2000
        gsrelay -p 1080 -g rendezvous:2000
    File transfer:
        gsrelay -l -r -g rendezvous:2000 > out.bin
        gsrelay -g rendezvous:2000 < in.bin

ENVIRONMENT
    GSRELAY_ADDR    rendezvous address used when -g is not given
";

#[derive(Parser, Debug)]
#[command(name = "gsrelay", about = "relay TCP, shells and SOCKS between NAT'd peers")]
struct Args {
    /// Run as server: wait at the rendezvous point
    #[arg(short = 'l')]
    listen: bool,

    /// TCP port to listen on (client) or forward to (server)
    #[arg(short = 'p')]
    port: Option<u16>,

    /// IPv4 address for server-side port forwarding
    #[arg(short = 'd', value_name = "IP")]
    dst: Option<Ipv4Addr>,

    /// Execute a command for every peer (e.g. "bash -il" or "id")
    #[arg(short = 'e', value_name = "CMD")]
    cmd: Option<String>,

    /// Interactive login shell with raw TTY; "~." terminates
    #[arg(short = 'i')]
    interactive: bool,

    /// Act as a SOCKS4/5 server (implies -l)
    #[arg(short = 'S')]
    socks: bool,

    /// Daemonize; quiet unless a log file is set
    #[arg(short = 'D')]
    daemon: bool,

    /// Receive only; quit on transport EOF
    #[arg(short = 'r')]
    receive_only: bool,

    /// Suppress all log output
    #[arg(short = 'q')]
    quiet: bool,

    /// Append log output to a file
    #[arg(short = 'L', value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Rendezvous address (host:port); defaults to $GSRELAY_ADDR
    #[arg(short = 'g', value_name = "ADDR")]
    rendezvous: Option<SocketAddr>,

    /// Print the manual
    #[arg(short = 'm')]
    manual: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            process::exit(255);
        }
    };
    if args.manual {
        print!("{MANUAL}");
        return;
    }

    let Some(cfg) = build_config(args) else {
        process::exit(255);
    };
    init_logging(&cfg);
    tty::install_cleanup();

    let transport = TcpGs::new(cfg.rendezvous);
    let daemonize = cfg.daemon;
    let mut relay = match Relay::new(cfg, transport) {
        Ok(relay) => relay,
        Err(e) => {
            error!("{e}");
            eprintln!("gsrelay: {e}");
            process::exit(255);
        }
    };

    if daemonize && let Err(e) = daemon::daemonize() {
        eprintln!("gsrelay: cannot daemonize: {e}");
        process::exit(255);
    }

    let code = relay.run();
    tty::reset();
    process::exit(code);
}

fn build_config(args: Args) -> Option<Config> {
    let rendezvous = args
        .rendezvous
        .or_else(|| std::env::var("GSRELAY_ADDR").ok()?.parse().ok())
        .or_else(|| {
            eprintln!("gsrelay: no rendezvous address; pass -g or set GSRELAY_ADDR");
            None
        })?;

    let role = if args.listen || args.socks { Role::Server } else { Role::Client };
    let mut cfg = Config::new(role, rendezvous);
    cfg.port = args.port.unwrap_or(0);
    cfg.dst_ip = args.dst;
    cfg.cmd = args.cmd;
    cfg.interactive = args.interactive;
    cfg.socks = args.socks;
    cfg.receive_only = args.receive_only;
    cfg.daemon = args.daemon;
    cfg.log_file = args.log_file;
    cfg.quiet = args.quiet || (args.daemon && cfg.log_file.is_none());

    cfg.multi_peer = match role {
        // the server serves one stdio peer at a time; every other sink
        // multiplexes
        Role::Server => {
            cfg.port != 0 || cfg.dst_ip.is_some() || cfg.cmd.is_some() || cfg.socks
                || cfg.interactive
        }
        Role::Client => cfg.port != 0,
    };
    Some(cfg)
}

fn init_logging(cfg: &Config) {
    if cfg.quiet {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match &cfg.log_file {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => builder.with_writer(Mutex::new(file)).with_ansi(false).init(),
            Err(e) => {
                eprintln!("gsrelay: cannot open log file: {e}");
                builder.with_writer(io::stderr).init();
            }
        },
        None => builder.with_writer(io::stderr).init(),
    }
}
