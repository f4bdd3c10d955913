use std::collections::HashMap;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::error;

use weft::driver::{self, ConfigSource, DriverOptions};
use weft::logger::init_tracing;

#[derive(Parser, Debug)]
#[command(
    name = "weft",
    about = "Runs a weft packet-processing configuration at user level",
    version,
    disable_help_flag = true
)]
struct Cli {
    /// Read the router configuration from FILE
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Use EXPR as the router configuration
    #[arg(short = 'e', long = "expression", value_name = "EXPR")]
    expression: Option<String>,

    /// Write the flat configuration to FILE ('-' for stdout)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// Listen for control connections on a TCP port; PORT+ tries
    /// successive ports on collision
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    port: Vec<String>,

    /// Listen for control connections on a UNIX socket
    #[arg(short = 'u', long = "unix-socket", value_name = "PATH")]
    unix_socket: Vec<String>,

    /// Call ELEMENT.H after the driver runs and print the result
    #[arg(short = 'h', long = "handler", value_name = "ELEMENT.H")]
    handler: Vec<String>,

    /// Use the value of ELEMENT.H as the exit status
    #[arg(short = 'x', long = "exit-handler", value_name = "ELEMENT.H")]
    exit_handler: Option<String>,

    /// Provide a writable 'hotconfig' handler
    #[arg(short = 'R', long = "allow-reconfigure")]
    allow_reconfigure: bool,

    /// Number of driver threads
    #[arg(long = "threads", value_name = "N", default_value_t = 1)]
    threads: usize,

    /// Parse and initialize the configuration, but do not run the driver
    #[arg(short = 'q', long = "quit")]
    quit: bool,

    /// Print user/system/wall time spent in the driver
    #[arg(short = 't', long = "time")]
    time: bool,

    /// Do not print warnings
    #[arg(short = 'w', long = "no-warnings")]
    no_warnings: bool,

    /// Search PATH for relative configuration files
    #[arg(short = 'C', long = "search-path", value_name = "PATH")]
    search_path: Option<PathBuf>,

    /// Print help
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// CONFIGFILE, or PARAM=VALUE definitions usable as $PARAM
    #[arg(value_name = "CONFIGFILE | PARAM=VALUE")]
    rest: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(if cli.no_warnings { "error" } else { "warn" });

    // trailing arguments: PARAM=VALUE definitions, or the config file
    let mut defines = HashMap::new();
    let mut positional_file: Option<PathBuf> = None;
    for arg in &cli.rest {
        let is_define = arg
            .split_once('=')
            .map(|(name, _)| {
                !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
            })
            .unwrap_or(false);
        if is_define {
            let (name, value) = arg.split_once('=').expect("checked above");
            if defines.insert(name.to_string(), value.to_string()).is_some() {
                error!("parameter '{}' multiply defined", name);
                process::exit(1);
            }
        } else if positional_file.is_none() {
            positional_file = Some(PathBuf::from(arg));
        } else {
            error!("router configuration specified twice");
            process::exit(1);
        }
    }

    let source = match (cli.file, cli.expression, positional_file) {
        (Some(file), None, None) => ConfigSource::File(file),
        (None, Some(expr), None) => ConfigSource::Expr(expr),
        (None, None, Some(file)) => ConfigSource::File(file),
        (None, None, None) => {
            error!("no router configuration; use -f FILE or -e EXPR");
            process::exit(1);
        }
        _ => {
            error!("router configuration specified twice");
            process::exit(1);
        }
    };

    let mut opts = DriverOptions::new(source);
    opts.output = cli.output;
    opts.tcp_ports = cli.port;
    opts.unix_sockets = cli.unix_socket;
    opts.handlers = cli.handler;
    opts.exit_handler = cli.exit_handler;
    opts.allow_reconfigure = cli.allow_reconfigure;
    opts.threads = cli.threads;
    opts.quit = cli.quit;
    opts.report_time = cli.time;
    opts.warnings = !cli.no_warnings;
    opts.search_path = cli.search_path;
    opts.defines = defines;

    match driver::run(opts) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}
