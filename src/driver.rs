//! Driver entry: wires signals, loads the configuration, installs
//! control sockets and the `hotconfig` handler, runs the driver
//! loops, then invokes any requested handlers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{error, warn};

use crate::args::parse_bool;
use crate::element::ElementRegistry;
use crate::elements;
use crate::lang::{self, ElementDecl, Landmark};
use crate::router::{HandlerError, HandlerFlags, Router};
use crate::schedule::Master;

static STOP: AtomicBool = AtomicBool::new(false);

/// Polled by driver loops; set from the signal handler.
pub(crate) fn stop_pending() -> bool {
    STOP.load(Ordering::Relaxed)
}

extern "C" fn handle_stop_signal(_: i32) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        // SIGINT/SIGTERM request shutdown through the runcount path;
        // SIGPIPE must not kill the process when a control client
        // disconnects mid-reply
        let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_stop_signal));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle_stop_signal));
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    });
}

#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Expr(String),
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub source: ConfigSource,
    pub output: Option<PathBuf>,
    pub tcp_ports: Vec<String>,
    pub unix_sockets: Vec<String>,
    pub handlers: Vec<String>,
    pub exit_handler: Option<String>,
    pub allow_reconfigure: bool,
    pub threads: usize,
    pub quit: bool,
    pub report_time: bool,
    pub warnings: bool,
    pub search_path: Option<PathBuf>,
    pub defines: HashMap<String, String>,
}

impl DriverOptions {
    pub fn new(source: ConfigSource) -> Self {
        DriverOptions {
            source,
            output: None,
            tcp_ports: Vec::new(),
            unix_sockets: Vec::new(),
            handlers: Vec::new(),
            exit_handler: None,
            allow_reconfigure: false,
            threads: 1,
            quit: false,
            report_time: false,
            warnings: true,
            search_path: None,
            defines: HashMap::new(),
        }
    }
}

/// Everything a `hotconfig` write needs to build and install a
/// replacement router.
struct SwapContext {
    master: Weak<Master>,
    registry: ElementRegistry,
    tcp_ports: Vec<String>,
    unix_sockets: Vec<String>,
    defines: HashMap<String, String>,
}

fn control_socket_name(index: usize) -> String {
    if index == 0 {
        "weft_driver@@ControlSocket".to_string()
    } else {
        format!("weft_driver@@ControlSocket@{}", index)
    }
}

/// Parse text and run the loader, appending the driver's control
/// socket elements. Hot-swap candidates get bind retries because the
/// outgoing router still owns the addresses.
#[allow(clippy::too_many_arguments)]
fn parse_and_build(
    text: &str,
    filename: &str,
    registry: &ElementRegistry,
    master: &Arc<Master>,
    tcp_ports: &[String],
    unix_sockets: &[String],
    defines: &HashMap<String, String>,
    hotswap: bool,
) -> Result<Arc<Router>, Vec<String>> {
    let classes = registry.class_names();
    let mut parsed = lang::parse_string(text, filename, &classes, defines)
        .map_err(|errs| errs.iter().map(|e| e.to_string()).collect::<Vec<_>>())?;

    let retries = if hotswap { ", RETRIES 50" } else { "" };
    for (i, port) in tcp_ports.iter().enumerate() {
        parsed.elements.push(ElementDecl {
            name: control_socket_name(i),
            class: "ControlSocket".to_string(),
            config: format!("tcp, {}{}", port, retries),
            landmark: Landmark::expr(),
        });
    }
    for (i, path) in unix_sockets.iter().enumerate() {
        parsed.elements.push(ElementDecl {
            name: control_socket_name(tcp_ports.len() + i),
            class: "ControlSocket".to_string(),
            config: format!("unix, {}{}", path, retries),
            landmark: Landmark::expr(),
        });
    }

    Router::from_config(&parsed, text, registry, master)
        .map_err(|errs| errs.iter().map(|e| e.to_string()).collect())
}

/// Install the writable `hotconfig` handler. Each accepted candidate
/// gets the handler too, so reconfiguration keeps working after a
/// swap.
fn install_hotconfig(router: &Router, ctx: Arc<SwapContext>) {
    let captured = Arc::clone(&ctx);
    router.add_root_write_handler(
        "hotconfig",
        HandlerFlags::RAW_NONEXCLUSIVE,
        move |_args, text| {
            let master = captured
                .master
                .upgrade()
                .ok_or_else(|| HandlerError::message("driver is gone"))?;
            let candidate = parse_and_build(
                text,
                "<hotconfig>",
                &captured.registry,
                &master,
                &captured.tcp_ports,
                &captured.unix_sockets,
                &captured.defines,
                true,
            )
            .map_err(|errs| HandlerError::message(errs.join("; ")))?;
            if let Some(current) = master.current_router() {
                candidate.set_hotswap_predecessor(current);
            }
            install_hotconfig(&candidate, Arc::clone(&captured));
            master.request_hotswap(candidate).map_err(HandlerError::message)
        },
    );
}

fn resolve_config_path(file: &Path, search_path: Option<&Path>) -> Result<PathBuf> {
    if file.exists() || file.is_absolute() {
        return Ok(file.to_path_buf());
    }
    if let Some(dir) = search_path {
        let candidate = dir.join(file);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Ok(file.to_path_buf())
}

fn rusage_times() -> (f64, f64) {
    use nix::sys::resource::{getrusage, UsageWho};
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let user = usage.user_time();
            let system = usage.system_time();
            (
                user.tv_sec() as f64 + user.tv_usec() as f64 / 1e6,
                system.tv_sec() as f64 + system.tv_usec() as f64 / 1e6,
            )
        }
        Err(_) => (0.0, 0.0),
    }
}

/// Run the driver to completion. Returns the process exit code.
pub fn run(opts: DriverOptions) -> Result<i32> {
    install_signal_handlers();
    let registry = elements::default_registry();

    let (text, filename) = match &opts.source {
        ConfigSource::Expr(expr) => (expr.clone(), "<expr>".to_string()),
        ConfigSource::File(file) => {
            let path = resolve_config_path(file, opts.search_path.as_deref())?;
            let text = fs::read_to_string(&path)
                .with_context(|| format!("cannot read configuration '{}'", path.display()))?;
            (text, path.display().to_string())
        }
    };

    let master = Master::new(opts.threads);
    let swap_ctx = Arc::new(SwapContext {
        master: Arc::downgrade(&master),
        registry: registry.clone(),
        tcp_ports: opts.tcp_ports.clone(),
        unix_sockets: opts.unix_sockets.clone(),
        defines: opts.defines.clone(),
    });

    let router = match parse_and_build(
        &text,
        &filename,
        &registry,
        &master,
        &opts.tcp_ports,
        &opts.unix_sockets,
        &opts.defines,
        false,
    ) {
        Ok(router) => router,
        Err(errors) => {
            for e in &errors {
                error!("{}", e);
            }
            bail!(
                "router configuration failed ({} error{})",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" }
            );
        }
    };

    if opts.allow_reconfigure {
        install_hotconfig(&router, Arc::clone(&swap_ctx));
    }
    master.install(Arc::clone(&router));

    let mut exit_value = 0i32;

    if let Some(output) = &opts.output {
        let flat = router.flat_config();
        if output.as_path() == Path::new("-") {
            print!("{}", flat);
        } else {
            fs::write(output, flat)
                .with_context(|| format!("cannot write '{}'", output.display()))?;
        }
    }

    let (user_before, sys_before) = rusage_times();
    let wall_before = Instant::now();

    if !opts.quit && router.nelements() > 0 {
        router.activate();
        master.run();
    } else if !opts.quit && opts.warnings {
        warn!(config = %filename, "configuration has no elements, exiting");
    }

    if opts.report_time {
        let (user_after, sys_after) = rusage_times();
        let wall = wall_before.elapsed().as_secs_f64();
        println!(
            "{:.3}u {:.3}s {}:{:05.2}",
            user_after - user_before,
            sys_after - sys_before,
            (wall / 60.0) as u64,
            wall % 60.0
        );
    }

    // handlers run against whatever router is current after the run
    // (a hot-swap may have replaced the original)
    let current = master.current_router().unwrap_or(router);

    if !opts.handlers.is_empty() && call_read_handlers(&current, &opts.handlers).is_err() {
        exit_value = 1;
    }

    if let Some(spec) = &opts.exit_handler {
        exit_value = exit_handler_value(&current, spec);
    }

    Ok(exit_value)
}

/// Print the value of each requested read handler, expanding element
/// globs and class selections the way the control socket does.
fn call_read_handlers(router: &Arc<Router>, specs: &[String]) -> Result<(), ()> {
    let mut failed = false;
    let print_names = specs.len() > 1;

    for spec in specs {
        match spec.rsplit_once('.') {
            None => {
                print_one(router, spec, print_names, &mut failed);
            }
            Some((pattern, hname)) => {
                let elements = router.expand_pattern(pattern);
                if elements.is_empty() {
                    error!("no element matching '{}'", pattern);
                    failed = true;
                    continue;
                }
                let print = print_names || elements.len() > 1;
                for index in elements {
                    let full = format!("{}.{}", router.ename(index), hname);
                    print_one(router, &full, print, &mut failed);
                }
            }
        }
    }

    if failed {
        Err(())
    } else {
        Ok(())
    }
}

fn print_one(router: &Router, spec: &str, print_name: bool, failed: &mut bool) {
    match router.call_read(spec) {
        Ok(mut value) => {
            let raw = router.handler(spec).map(|h| h.raw()).unwrap_or(false);
            if !raw && !value.ends_with('\n') {
                value.push('\n');
            }
            if print_name {
                println!("{}:", spec);
            }
            print!("{}", value);
            if print_name {
                println!();
            }
        }
        Err(e) => {
            error!("{}", e);
            *failed = true;
        }
    }
}

/// The exit handler's value becomes the exit code: an integer
/// verbatim, a boolean as 0/1.
fn exit_handler_value(router: &Router, spec: &str) -> i32 {
    match router.call_read(spec) {
        Ok(value) => {
            let value = value.trim();
            if let Ok(code) = value.parse::<i32>() {
                code
            } else if let Some(b) = parse_bool(value) {
                if b {
                    0
                } else {
                    1
                }
            } else {
                error!("exit handler value should be integer or boolean");
                -1
            }
        }
        Err(e) => {
            error!("{}", e);
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_socket_names_are_distinct() {
        assert_eq!(control_socket_name(0), "weft_driver@@ControlSocket");
        assert_ne!(control_socket_name(0), control_socket_name(1));
    }

    #[test]
    fn test_resolve_config_path_uses_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("router.weft");
        fs::write(&file, "Idle;").unwrap();

        let found =
            resolve_config_path(Path::new("router.weft"), Some(dir.path())).unwrap();
        assert_eq!(found, file);

        // an existing relative path wins over the search path
        let missing = resolve_config_path(Path::new("nope.weft"), Some(dir.path())).unwrap();
        assert_eq!(missing, Path::new("nope.weft"));
    }
}
