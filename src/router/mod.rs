//! Router: the compiled element graph.
//!
//! A Router owns its elements (indices are stable handles), the
//! resolved connection tables, the handler registry, and the runcount
//! that driver loops watch. Construction runs the loader pipeline:
//! instantiate, configure (error-accumulating), resolve port
//! directions, link, then initialize in dependency order. After
//! initialization the element and connection tables are frozen and
//! all packet-path reads are lock-free.

mod handler;

pub use handler::{
    glob_match, is_glob, Handler, HandlerArgs, HandlerBuilder, HandlerError, HandlerFlags,
};
pub(crate) use handler::{HandlerRegistry, ReadFn, WriteFn};

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::args::Args;
use crate::element::{
    CleanupStage, Element, ElementError, ElementIndex, ElementRegistry, PortKind,
};
use crate::lang::{Landmark, ParsedConfig};
use crate::packet::Packet;
use crate::schedule::{Master, NotifierSignal, Task, Timer};

/// Runcount value meaning "stop the driver".
pub const STOP_RUNCOUNT: i32 = i32::MIN + 1;
/// Runcount installed at activation.
const RUNCOUNT_ACTIVE: i32 = i32::MAX;

/// How far an upstream notifier search will walk before giving up.
const NOTIFIER_SEARCH_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{landmark}: unknown element class '{class}'")]
    UnknownClass { landmark: Landmark, class: String },

    #[error("{landmark}: {element} :: {class}: {source}")]
    Configure {
        landmark: Landmark,
        element: String,
        class: String,
        source: ElementError,
    },

    #[error("{landmark}: duplicate connection at {what}")]
    DuplicateConnection { landmark: Landmark, what: String },

    #[error("{element}: {kind} port count {count} out of range {min}-{max}")]
    PortCount {
        element: String,
        kind: &'static str,
        count: usize,
        min: usize,
        max: usize,
    },

    #[error("{landmark}: cannot connect '{from}' ({from_kind}) to '{to}' ({to_kind})")]
    Mismatch {
        landmark: Landmark,
        from: String,
        from_kind: PortKind,
        to: String,
        to_kind: PortKind,
    },

    #[error("{element}: agnostic port directions stay unresolved")]
    Unresolved { element: String },

    #[error("{element}: {kind} port {port} unconnected")]
    Unconnected {
        element: String,
        kind: &'static str,
        port: usize,
    },

    #[error("{element}: initialization failed: {source}")]
    Initialize {
        element: String,
        source: ElementError,
    },
}

/// One resolved connection, by element index.
#[derive(Debug, Clone)]
pub struct Connection {
    pub from: ElementIndex,
    pub from_port: usize,
    pub to: ElementIndex,
    pub to_port: usize,
}

/// Resolved peer of one port. Stored per port so per-packet transfer
/// is a single indexed load with no dynamic dispatch beyond the
/// element itself.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub peer: ElementIndex,
    pub port: usize,
    pub kind: PortKind,
}

pub(crate) struct ElementEntry {
    name: String,
    class: String,
    config: String,
    landmark: Landmark,
    ninputs: usize,
    noutputs: usize,
    element: Box<dyn Element>,
}

/// Placeholder occupying an entry's slot while its real element is
/// temporarily owned by the initialization loop.
struct Vacant;

impl Element for Vacant {
    fn class_name(&self) -> &'static str {
        "@vacant"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Router {
    entries: Vec<ElementEntry>,
    name_to_index: HashMap<String, ElementIndex>,
    connections: Vec<Connection>,
    links_in: Vec<Vec<Option<Link>>>,
    links_out: Vec<Vec<Option<Link>>>,
    requirements: Vec<String>,
    config_text: String,
    flat_text: String,
    runcount: AtomicI32,
    initialized: bool,
    master: Weak<Master>,
    handlers: HandlerRegistry,
    element_locks: Vec<Mutex<()>>,
    tasks: Mutex<Vec<Task>>,
    timers: Mutex<Vec<Timer>>,
    hotswap_from: Mutex<Option<Arc<Router>>>,
}

impl Router {
    /// Run the loader pipeline over a parsed configuration. On any
    /// error the partial router is torn down and every error found so
    /// far is reported.
    pub fn from_config(
        parsed: &ParsedConfig,
        config_text: &str,
        registry: &ElementRegistry,
        master: &Arc<Master>,
    ) -> Result<Arc<Router>, Vec<RouterError>> {
        let mut errors: Vec<RouterError> = Vec::new();

        // instantiate
        let mut entries: Vec<ElementEntry> = Vec::with_capacity(parsed.elements.len());
        let mut name_to_index = HashMap::new();
        for decl in &parsed.elements {
            match registry.make(&decl.class) {
                Some(element) => {
                    name_to_index.insert(decl.name.clone(), entries.len());
                    entries.push(ElementEntry {
                        name: decl.name.clone(),
                        class: decl.class.clone(),
                        config: decl.config.clone(),
                        landmark: decl.landmark.clone(),
                        ninputs: 0,
                        noutputs: 0,
                        element,
                    });
                }
                None => errors.push(RouterError::UnknownClass {
                    landmark: decl.landmark.clone(),
                    class: decl.class.clone(),
                }),
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        // configure, reporting as many errors as possible
        for entry in entries.iter_mut() {
            let result = Args::parse(&entry.config)
                .map_err(ElementError::from)
                .and_then(|args| entry.element.configure(&args));
            if let Err(source) = result {
                errors.push(RouterError::Configure {
                    landmark: entry.landmark.clone(),
                    element: entry.name.clone(),
                    class: entry.class.clone(),
                    source,
                });
            }
        }

        // index the connections
        let mut connections = Vec::with_capacity(parsed.connections.len());
        for conn in &parsed.connections {
            let (Some(&from), Some(&to)) = (
                name_to_index.get(&conn.from),
                name_to_index.get(&conn.to),
            ) else {
                // parser guarantees endpoints are declared; a miss here
                // means a class failed to instantiate above
                continue;
            };
            connections.push((
                Connection {
                    from,
                    from_port: conn.from_port,
                    to,
                    to_port: conn.to_port,
                },
                conn.landmark.clone(),
            ));
        }

        // port counts: highest used index, floored by the class minimum
        for (conn, _) in &connections {
            entries[conn.from].noutputs = entries[conn.from].noutputs.max(conn.from_port + 1);
            entries[conn.to].ninputs = entries[conn.to].ninputs.max(conn.to_port + 1);
        }
        for entry in entries.iter_mut() {
            let pc = entry.element.port_count();
            entry.ninputs = entry.ninputs.max(pc.imin);
            entry.noutputs = entry.noutputs.max(pc.omin);
            if entry.ninputs > pc.imax {
                errors.push(RouterError::PortCount {
                    element: entry.name.clone(),
                    kind: "input",
                    count: entry.ninputs,
                    min: pc.imin,
                    max: pc.imax,
                });
            }
            if entry.noutputs > pc.omax {
                errors.push(RouterError::PortCount {
                    element: entry.name.clone(),
                    kind: "output",
                    count: entry.noutputs,
                    min: pc.omin,
                    max: pc.omax,
                });
            }
        }

        // the graph is not a multigraph on port pairs
        let mut out_seen = HashSet::new();
        let mut in_seen = HashSet::new();
        for (conn, landmark) in &connections {
            if !out_seen.insert((conn.from, conn.from_port)) {
                errors.push(RouterError::DuplicateConnection {
                    landmark: landmark.clone(),
                    what: format!("{} [{}]", entries[conn.from].name, conn.from_port),
                });
            }
            if !in_seen.insert((conn.to, conn.to_port)) {
                errors.push(RouterError::DuplicateConnection {
                    landmark: landmark.clone(),
                    what: format!("[{}] {}", conn.to_port, entries[conn.to].name),
                });
            }
        }

        // resolve agnostic port directions by propagation
        let resolved = resolve_directions(&entries, &connections, &mut errors);

        if !errors.is_empty() {
            for entry in entries.iter_mut() {
                entry.element.cleanup(CleanupStage::Configured);
            }
            return Err(errors);
        }

        // link tables
        let mut links_in: Vec<Vec<Option<Link>>> =
            entries.iter().map(|e| vec![None; e.ninputs]).collect();
        let mut links_out: Vec<Vec<Option<Link>>> =
            entries.iter().map(|e| vec![None; e.noutputs]).collect();
        for (conn, _) in &connections {
            let kind = resolved.output_kind(conn.from, conn.from_port);
            links_out[conn.from][conn.from_port] = Some(Link {
                peer: conn.to,
                port: conn.to_port,
                kind,
            });
            links_in[conn.to][conn.to_port] = Some(Link {
                peer: conn.from,
                port: conn.from_port,
                kind,
            });
        }

        // every non-optional port has exactly one peer
        for (i, entry) in entries.iter().enumerate() {
            if entry.element.allow_unconnected() {
                continue;
            }
            for (port, link) in links_in[i].iter().enumerate() {
                if link.is_none() {
                    errors.push(RouterError::Unconnected {
                        element: entry.name.clone(),
                        kind: "input",
                        port,
                    });
                }
            }
            for (port, link) in links_out[i].iter().enumerate() {
                if link.is_none() {
                    errors.push(RouterError::Unconnected {
                        element: entry.name.clone(),
                        kind: "output",
                        port,
                    });
                }
            }
        }

        if !errors.is_empty() {
            for entry in entries.iter_mut() {
                entry.element.cleanup(CleanupStage::Configured);
            }
            return Err(errors);
        }

        let mut requirements = Vec::new();
        for req in &parsed.requirements {
            if !requirements.contains(req) {
                requirements.push(req.clone());
            }
        }

        let connections: Vec<Connection> = connections.into_iter().map(|(c, _)| c).collect();
        let flat_text = compose_flat_text(&entries, &connections, &requirements);
        let order = initialization_order(entries.len(), &connections, &entries);

        let nelements = entries.len();
        let mut init_errors: Vec<RouterError> = Vec::new();
        let router = Arc::new_cyclic(|weak: &Weak<Router>| {
            let mut router = Router {
                entries,
                name_to_index,
                connections,
                links_in,
                links_out,
                requirements,
                config_text: config_text.to_string(),
                flat_text,
                runcount: AtomicI32::new(0),
                initialized: false,
                master: Arc::downgrade(master),
                handlers: HandlerRegistry::default(),
                element_locks: (0..nelements).map(|_| Mutex::new(())).collect(),
                tasks: Mutex::new(Vec::new()),
                timers: Mutex::new(Vec::new()),
                hotswap_from: Mutex::new(None),
            };

            router.install_root_handlers();
            for i in 0..nelements {
                router.install_element_handlers(i);
                let mut builder = HandlerBuilder {
                    registry: &router.handlers,
                    element: i,
                    element_name: &router.entries[i].name,
                };
                router.entries[i].element.add_handlers(&mut builder);
            }

            // initialize in dependency order: suppliers before
            // consumers, so shared state comes up first
            let mut live: Vec<ElementIndex> = Vec::new();
            for &i in &order {
                let mut element =
                    std::mem::replace(&mut router.entries[i].element, Box::new(Vacant));
                let mut ctx = InitContext {
                    router: &router,
                    weak: weak.clone(),
                    master,
                    element: i,
                };
                match element.initialize(&mut ctx) {
                    Ok(()) => {
                        router.entries[i].element = element;
                        live.push(i);
                        trace!(element = %router.entries[i].name, "initialized");
                    }
                    Err(source) => {
                        element.cleanup(CleanupStage::InitializeFailed);
                        init_errors.push(RouterError::Initialize {
                            element: router.entries[i].name.clone(),
                            source,
                        });
                        router.entries[i].element = element;
                        break;
                    }
                }
            }

            if init_errors.is_empty() {
                router.initialized = true;
            } else {
                // unwind the ones that made it
                for &i in live.iter().rev() {
                    router.entries[i].element.cleanup(CleanupStage::Initialized);
                }
            }
            router
        });

        if init_errors.is_empty() {
            debug!(
                elements = router.nelements(),
                connections = router.connections.len(),
                "router initialized"
            );
            Ok(router)
        } else {
            Err(init_errors)
        }
    }

    pub fn nelements(&self) -> usize {
        self.entries.len()
    }

    pub fn element(&self, index: ElementIndex) -> &dyn Element {
        self.entries[index].element.as_ref()
    }

    pub fn ename(&self, index: ElementIndex) -> &str {
        &self.entries[index].name
    }

    pub fn eclass(&self, index: ElementIndex) -> &str {
        &self.entries[index].class
    }

    pub fn find(&self, name: &str) -> Option<ElementIndex> {
        self.name_to_index.get(name).copied()
    }

    pub fn ninputs(&self, index: ElementIndex) -> usize {
        self.entries[index].ninputs
    }

    pub fn noutputs(&self, index: ElementIndex) -> usize {
        self.entries[index].noutputs
    }

    pub fn input_link(&self, index: ElementIndex, port: usize) -> Option<Link> {
        self.links_in.get(index)?.get(port).copied().flatten()
    }

    pub fn output_link(&self, index: ElementIndex, port: usize) -> Option<Link> {
        self.links_out.get(index)?.get(port).copied().flatten()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn requirements(&self) -> &[String] {
        &self.requirements
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn master(&self) -> Option<Arc<Master>> {
        self.master.upgrade()
    }

    pub fn flat_config(&self) -> &str {
        &self.flat_text
    }

    pub fn config_text(&self) -> &str {
        &self.config_text
    }

    pub fn runcount(&self) -> i32 {
        self.runcount.load(Ordering::Acquire)
    }

    /// Request driver shutdown: drivers exit after finishing the
    /// current task invocation.
    pub fn please_stop(&self) {
        self.runcount.store(STOP_RUNCOUNT, Ordering::Release);
        if let Some(master) = self.master.upgrade() {
            master.wake_all();
        }
    }

    /// Record the predecessor a hot-swap candidate may steal state
    /// from during activation.
    pub fn set_hotswap_predecessor(&self, old: Arc<Router>) {
        *self.hotswap_from.lock() = Some(old);
    }

    /// Go live: adopt predecessor state, raise the runcount, schedule
    /// every registered task and flush armed timers to their threads.
    pub fn activate(&self) {
        if let Some(old) = self.hotswap_from.lock().take() {
            for entry in &self.entries {
                if let Some(j) = old.find(&entry.name) {
                    entry.element.take_state(old.element(j));
                }
            }
        }
        self.runcount.store(RUNCOUNT_ACTIVE, Ordering::Release);
        for task in self.tasks.lock().iter() {
            task.reschedule();
        }
        for timer in self.timers.lock().iter() {
            timer.flush_pending_arm();
        }
    }

    pub(crate) fn run_task_for(&self, index: ElementIndex) -> bool {
        let ports = Ports {
            router: self,
            index,
        };
        self.entries[index].element.run_task(&ports)
    }

    pub(crate) fn run_timer_for(&self, index: ElementIndex) {
        let ports = Ports {
            router: self,
            index,
        };
        self.entries[index].element.run_timer(&ports)
    }

    /// Walk upstream from a pull input looking for an exported
    /// availability signal; falls back to always-active when the path
    /// has none.
    pub fn upstream_empty_signal(
        &self,
        element: ElementIndex,
        in_port: usize,
    ) -> NotifierSignal {
        let mut at = (element, in_port);
        for _ in 0..NOTIFIER_SEARCH_DEPTH {
            let Some(link) = self.input_link(at.0, at.1) else {
                break;
            };
            if let Some(signal) = self.element(link.peer).notifier_signal() {
                return signal;
            }
            if self.ninputs(link.peer) == 0 {
                break;
            }
            at = (link.peer, 0);
        }
        NotifierSignal::always_active()
    }

    // ---- handler plane ----

    /// Resolve `element.handler` (or bare `handler` for the root).
    pub fn handler(&self, spec: &str) -> Result<Arc<Handler>, HandlerError> {
        if let Some((ename, hname)) = spec.rsplit_once('.') {
            if self.find(ename).is_none() {
                return Err(HandlerError::NoElement(ename.to_string()));
            }
            return self
                .handlers
                .get(Some(ename), hname)
                .ok_or_else(|| HandlerError::NoHandler(spec.to_string()));
        }
        self.handlers
            .get(None, spec)
            .ok_or_else(|| HandlerError::NoHandler(spec.to_string()))
    }

    pub fn call_read(&self, spec: &str) -> Result<String, HandlerError> {
        let handler = self.handler(spec)?;
        let f = handler
            .read_fn()
            .cloned()
            .ok_or_else(|| HandlerError::NotReadable(spec.to_string()))?;
        let _guard = self.handler_guard(&handler);
        let args = HandlerArgs {
            element: handler.element().map(|i| self.element(i)),
            router: self,
        };
        f(&args)
    }

    pub fn call_write(&self, spec: &str, value: &str) -> Result<(), HandlerError> {
        let handler = self.handler(spec)?;
        let f = handler
            .write_fn()
            .cloned()
            .ok_or_else(|| HandlerError::NotWritable(spec.to_string()))?;
        let _guard = self.handler_guard(&handler);
        let args = HandlerArgs {
            element: handler.element().map(|i| self.element(i)),
            router: self,
        };
        f(&args, value)
    }

    fn handler_guard(&self, handler: &Handler) -> Option<parking_lot::MutexGuard<'_, ()>> {
        match handler.element() {
            Some(i) if !handler.nonexclusive() => Some(self.element_locks[i].lock()),
            _ => None,
        }
    }

    /// Expand an element pattern: exact name, `class:Name` selection,
    /// shell glob over names, or a bare class name.
    pub fn expand_pattern(&self, pattern: &str) -> Vec<ElementIndex> {
        if let Some(i) = self.find(pattern) {
            return vec![i];
        }
        if let Some(class) = pattern.strip_prefix("class:") {
            let (class, _handler_part) = match class.rsplit_once('.') {
                Some((c, h)) => (c, Some(h)),
                None => (class, None),
            };
            return self.indices_of_class(class);
        }
        if is_glob(pattern) {
            return (0..self.nelements())
                .filter(|&i| glob_match(self.ename(i), pattern))
                .collect();
        }
        self.indices_of_class(pattern)
    }

    fn indices_of_class(&self, class: &str) -> Vec<ElementIndex> {
        (0..self.nelements())
            .filter(|&i| self.eclass(i) == class)
            .collect()
    }

    /// Install a router-global write handler; the driver uses this for
    /// `hotconfig`.
    pub fn add_root_write_handler<F>(&self, name: &str, flags: HandlerFlags, f: F)
    where
        F: Fn(&HandlerArgs<'_>, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let write: WriteFn = Arc::new(f);
        self.handlers.set(None, None, name, flags, None, Some(write));
    }

    pub fn add_root_read_handler<F>(&self, name: &str, flags: HandlerFlags, f: F)
    where
        F: Fn(&HandlerArgs<'_>) -> Result<String, HandlerError> + Send + Sync + 'static,
    {
        let read: ReadFn = Arc::new(f);
        self.handlers.set(None, None, name, flags, Some(read), None);
    }

    fn install_root_handlers(&self) {
        self.add_root_read_handler("flatconfig", HandlerFlags::RAW, |args| {
            Ok(args.router.flat_config().to_string())
        });
        self.add_root_read_handler("config", HandlerFlags::RAW, |args| {
            Ok(args.router.config_text().to_string())
        });
        self.add_root_read_handler("version", HandlerFlags::default(), |_| {
            Ok(env!("CARGO_PKG_VERSION").to_string())
        });
        self.add_root_read_handler("time", HandlerFlags::default(), |_| {
            Ok(chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string())
        });
        self.add_root_read_handler("requirements", HandlerFlags::default(), |args| {
            Ok(args.router.requirements().join("\n"))
        });
        self.add_root_read_handler("list", HandlerFlags::default(), |args| {
            let r = args.router;
            let mut out = format!("{}\n", r.nelements());
            for i in 0..r.nelements() {
                out.push_str(r.ename(i));
                out.push('\n');
            }
            Ok(out)
        });
        self.add_root_read_handler("threads", HandlerFlags::default(), |args| {
            let master = args
                .router
                .master()
                .ok_or_else(|| HandlerError::message("master is gone"))?;
            serde_json::to_string_pretty(&master.thread_stats())
                .map_err(|e| HandlerError::message(e.to_string()))
        });
        self.add_root_write_handler("stop", HandlerFlags::default(), |args, _| {
            args.router.please_stop();
            Ok(())
        });
    }

    /// The automatic per-element handlers every element carries.
    fn install_element_handlers(&self, index: ElementIndex) {
        let name = self.entries[index].name.clone();

        let set_read = |hname: &str, f: ReadFn| {
            self.handlers.set(
                Some(index),
                Some(&name),
                hname,
                HandlerFlags::default(),
                Some(f),
                None,
            );
        };

        set_read(
            "name",
            Arc::new(move |args| Ok(args.router.ename(index).to_string())),
        );
        set_read(
            "class",
            Arc::new(move |args| Ok(args.router.eclass(index).to_string())),
        );
        set_read(
            "config",
            Arc::new(move |args| Ok(args.router.entries[index].config.clone())),
        );
        set_read(
            "ports",
            Arc::new(move |args| Ok(args.router.unparse_ports(index))),
        );
        set_read(
            "handlers",
            Arc::new(move |args| {
                let name = args.router.ename(index);
                Ok(args.router.handlers.names_for(Some(name)).join("\n"))
            }),
        );
    }

    fn unparse_ports(&self, index: ElementIndex) -> String {
        let mut out = String::new();
        for (port, link) in self.links_in[index].iter().enumerate() {
            match link {
                Some(l) => {
                    let _ = writeln!(
                        out,
                        "input {}: {} from {} [{}]",
                        port,
                        l.kind,
                        self.ename(l.peer),
                        l.port
                    );
                }
                None => {
                    let _ = writeln!(out, "input {}: unconnected", port);
                }
            }
        }
        for (port, link) in self.links_out[index].iter().enumerate() {
            match link {
                Some(l) => {
                    let _ = writeln!(
                        out,
                        "output {}: {} to {} [{}]",
                        port,
                        l.kind,
                        self.ename(l.peer),
                        l.port
                    );
                }
                None => {
                    let _ = writeln!(out, "output {}: unconnected", port);
                }
            }
        }
        out
    }

    pub(crate) fn register_task(&self, task: Task) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn register_timer(&self, timer: Timer) {
        self.timers.lock().push(timer);
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if self.initialized {
            for entry in self.entries.iter_mut() {
                entry.element.cleanup(CleanupStage::Initialized);
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("elements", &self.nelements())
            .field("connections", &self.connections.len())
            .field("runcount", &self.runcount())
            .finish()
    }
}

/// An element's window onto its resolved ports. Push transfers
/// ownership downstream synchronously; pull asks upstream for a
/// packet. Direction mistakes and unconnected ports drop the packet
/// rather than fault the driver.
pub struct Ports<'a> {
    router: &'a Router,
    index: ElementIndex,
}

impl<'a> Ports<'a> {
    pub fn new(router: &'a Router, index: ElementIndex) -> Self {
        Ports { router, index }
    }

    pub fn router(&self) -> &Router {
        self.router
    }

    pub fn index(&self) -> ElementIndex {
        self.index
    }

    pub fn ninputs(&self) -> usize {
        self.router.ninputs(self.index)
    }

    pub fn noutputs(&self) -> usize {
        self.router.noutputs(self.index)
    }

    /// Emit a packet on an output port. Ownership transfers to the
    /// downstream element immediately; its `push` runs synchronously
    /// on this thread.
    pub fn push(&self, port: usize, packet: Packet) {
        match self.router.output_link(self.index, port) {
            Some(link) if link.kind == PortKind::Push => {
                let ports = Ports {
                    router: self.router,
                    index: link.peer,
                };
                self.router.element(link.peer).push(link.port, packet, &ports);
            }
            Some(link) => {
                debug_assert!(false, "push on a pull output");
                warn!(
                    element = %self.router.ename(self.index),
                    port,
                    kind = %link.kind,
                    "push on non-push output; packet dropped"
                );
            }
            None => {
                trace!(
                    element = %self.router.ename(self.index),
                    port,
                    "push on unconnected output; packet dropped"
                );
            }
        }
    }

    /// Request a packet from an input port. Returns ownership of one
    /// packet if upstream produces one.
    pub fn pull(&self, port: usize) -> Option<Packet> {
        match self.router.input_link(self.index, port) {
            Some(link) if link.kind == PortKind::Pull => {
                let ports = Ports {
                    router: self.router,
                    index: link.peer,
                };
                self.router.element(link.peer).pull(link.port, &ports)
            }
            Some(link) => {
                debug_assert!(false, "pull on a push input");
                warn!(
                    element = %self.router.ename(self.index),
                    port,
                    kind = %link.kind,
                    "pull on non-pull input"
                );
                None
            }
            None => None,
        }
    }
}

/// Late-binding context handed to `Element::initialize`.
pub struct InitContext<'a> {
    router: &'a Router,
    weak: Weak<Router>,
    master: &'a Arc<Master>,
    element: ElementIndex,
}

impl InitContext<'_> {
    pub fn router(&self) -> &Router {
        self.router
    }

    /// A weak handle to the router under construction, for elements
    /// that serve the control plane after initialization.
    pub fn router_weak(&self) -> Weak<Router> {
        self.weak.clone()
    }

    pub fn element_index(&self) -> ElementIndex {
        self.element
    }

    pub fn lookup(&self, name: &str) -> Option<ElementIndex> {
        self.router.find(name)
    }

    /// Register a task for this element on its home thread. Tasks are
    /// scheduled when the router activates.
    pub fn add_task(&mut self) -> Task {
        let master = self.master;
        let task = Task::new(self.weak.clone(), self.element, 0, master.sender(0));
        self.router.register_task(task.clone());
        task
    }

    /// Register a timer for this element on its home thread.
    pub fn add_timer(&mut self) -> Timer {
        let master = self.master;
        let timer = Timer::new(self.weak.clone(), self.element, 0, master.sender(0));
        self.router.register_timer(timer.clone());
        timer
    }

    /// The availability signal a puller on `in_port` should listen to.
    pub fn upstream_signal(&self, in_port: usize) -> NotifierSignal {
        self.router.upstream_empty_signal(self.element, in_port)
    }
}

/// Resolved per-port output directions after agnostic propagation.
struct ResolvedDirections {
    outputs: Vec<Vec<PortKind>>,
}

impl ResolvedDirections {
    fn output_kind(&self, element: ElementIndex, port: usize) -> PortKind {
        self.outputs[element]
            .get(port)
            .copied()
            .unwrap_or(PortKind::Push)
    }
}

fn resolve_directions(
    entries: &[ElementEntry],
    connections: &[(Connection, Landmark)],
    errors: &mut Vec<RouterError>,
) -> ResolvedDirections {
    let n = entries.len();
    let mut agnostic: Vec<Option<PortKind>> = vec![None; n];

    let constraint = |i: usize, output: bool, port: usize| -> PortKind {
        let p = entries[i].element.processing();
        if output {
            p.output_kind(port)
        } else {
            p.input_kind(port)
        }
    };
    let value = |agn: &[Option<PortKind>], i: usize, output: bool, port: usize| {
        match constraint(i, output, port) {
            PortKind::Agnostic => agn[i],
            fixed => Some(fixed),
        }
    };

    // propagate concrete directions across connections until stable;
    // all agnostic ports of one element share one variable
    let mut conflict = false;
    loop {
        let mut changed = false;
        for (conn, landmark) in connections {
            let from = value(&agnostic, conn.from, true, conn.from_port);
            let to = value(&agnostic, conn.to, false, conn.to_port);
            match (from, to) {
                (Some(a), Some(b)) if a != b => {
                    if !conflict {
                        errors.push(RouterError::Mismatch {
                            landmark: landmark.clone(),
                            from: entries[conn.from].name.clone(),
                            from_kind: a,
                            to: entries[conn.to].name.clone(),
                            to_kind: b,
                        });
                        conflict = true;
                    }
                }
                (Some(a), None) => {
                    agnostic[conn.to] = Some(a);
                    changed = true;
                }
                (None, Some(b)) => {
                    agnostic[conn.from] = Some(b);
                    changed = true;
                }
                _ => {}
            }
        }
        if !changed {
            break;
        }
    }

    // after propagation every connected port must be push or pull
    let mut outputs = Vec::with_capacity(n);
    for (i, entry) in entries.iter().enumerate() {
        let mut unresolved = false;
        let fill = |output: bool, count: usize, unresolved: &mut bool| -> Vec<PortKind> {
            (0..count)
                .map(|port| match constraint(i, output, port) {
                    PortKind::Agnostic => match agnostic[i] {
                        Some(kind) => kind,
                        None => {
                            // only an error when something connects here
                            *unresolved = true;
                            PortKind::Push
                        }
                    },
                    fixed => fixed,
                })
                .collect()
        };
        fill(false, entry.ninputs, &mut unresolved);
        let outs = fill(true, entry.noutputs, &mut unresolved);

        let connected = connections.iter().any(|(c, _)| c.from == i || c.to == i);
        if unresolved && connected {
            errors.push(RouterError::Unresolved {
                element: entry.name.clone(),
            });
        }
        outputs.push(outs);
    }

    ResolvedDirections { outputs }
}

/// Initialization order: SCC condensation of the connection graph,
/// sources first. Non-trivial SCCs (packet loops) initialize in
/// declaration order and are reported.
fn initialization_order(
    n: usize,
    connections: &[Connection],
    entries: &[ElementEntry],
) -> Vec<ElementIndex> {
    let mut graph = DiGraph::<(), ()>::new();
    for _ in 0..n {
        graph.add_node(());
    }
    for conn in connections {
        graph.add_edge(
            petgraph::graph::NodeIndex::new(conn.from),
            petgraph::graph::NodeIndex::new(conn.to),
            (),
        );
    }
    // tarjan_scc returns components in reverse topological order;
    // reversing yields suppliers before consumers
    let mut order = Vec::with_capacity(n);
    for scc in tarjan_scc(&graph).into_iter().rev() {
        let mut members: Vec<usize> = scc.into_iter().map(|ix| ix.index()).collect();
        members.sort_unstable();
        if members.len() > 1 {
            let names: Vec<&str> = members.iter().map(|&i| entries[i].name.as_str()).collect();
            warn!(
                cycle = %names.join(" -> "),
                "circular initialization dependency; using declaration order"
            );
        }
        order.extend(members);
    }
    order
}

/// The canonical flat form: requirements, then declarations, then
/// connections with explicit ports. Parsing the result reproduces the
/// same graph, so flattening is a fixed point.
fn compose_flat_text(
    entries: &[ElementEntry],
    connections: &[Connection],
    requirements: &[String],
) -> String {
    let mut out = String::new();
    for req in requirements {
        let _ = writeln!(out, "require({});", req);
    }
    for entry in entries {
        if entry.config.is_empty() {
            let _ = writeln!(out, "{} :: {};", entry.name, entry.class);
        } else {
            let _ = writeln!(out, "{} :: {}({});", entry.name, entry.class, entry.config);
        }
    }
    for conn in connections {
        let _ = writeln!(
            out,
            "{} [{}] -> [{}] {};",
            entries[conn.from].name, conn.from_port, conn.to_port, entries[conn.to].name
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::default_registry;
    use crate::lang::parse_string;
    use std::collections::HashMap;

    fn build(text: &str) -> Result<Arc<Router>, Vec<RouterError>> {
        let registry = default_registry();
        let master = Master::new(1);
        let parsed = parse_string(text, "test", &registry.class_names(), &HashMap::new())
            .unwrap_or_else(|e| panic!("parse failed: {:?}", e));
        Router::from_config(&parsed, text, &registry, &master)
    }

    fn build_ok(text: &str) -> Arc<Router> {
        build(text).unwrap_or_else(|e| panic!("load failed: {:?}", e))
    }

    #[test]
    fn test_flat_config_is_a_fixed_point() {
        let text = "elementclass Pipe { input -> Counter -> output };\n\
                    src :: InfiniteSource(LENGTH 128, LIMIT 10);\n\
                    src -> Pipe -> q :: Queue(32) -> Unqueue -> Discard;";
        let first = build_ok(text);
        let flat = first.flat_config().to_string();

        let second = build_ok(&flat);
        assert_eq!(second.flat_config(), flat);
        assert_eq!(second.nelements(), first.nelements());
    }

    #[test]
    fn test_agnostic_resolution_along_a_push_chain() {
        // Source is push-only, Queue's input is push: the agnostic
        // counter must come out push on both sides, and the queue
        // drains by pull
        let router = build_ok(
            "src :: InfiniteSource; mid :: Counter; q :: Queue;\n\
             sink :: Discard;\n\
             src -> mid -> q; q -> sink;",
        );
        let mid = router.find("mid").unwrap();
        assert_eq!(router.input_link(mid, 0).unwrap().kind, PortKind::Push);
        assert_eq!(router.output_link(mid, 0).unwrap().kind, PortKind::Push);

        let q = router.find("q").unwrap();
        assert_eq!(router.output_link(q, 0).unwrap().kind, PortKind::Pull);

        // the automatic ports handler reports the same resolution
        let ports = router.call_read("mid.ports").unwrap();
        assert!(ports.contains("input 0: push from src [0]"));
        assert!(ports.contains("output 0: push to q [0]"));
    }

    #[test]
    fn test_direction_mismatch_is_an_error() {
        // a queue's pull output cannot feed a queue's push input
        let errors = build("q1 :: Queue; q2 :: Queue; q1 -> q2; \
                            InfiniteSource -> q1; q2 -> Unqueue -> Discard;")
            .err()
            .expect("expected load failure");
        assert!(errors
            .iter()
            .any(|e| matches!(e, RouterError::Mismatch { .. })));
    }

    #[test]
    fn test_agnostic_island_stays_unresolved() {
        let errors = build("a, b :: Counter; a -> b;")
            .err()
            .expect("expected load failure");
        assert!(errors
            .iter()
            .any(|e| matches!(e, RouterError::Unresolved { .. })));
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let errors = build(
            "s1, s2 :: InfiniteSource; c :: Counter; c -> Discard;\n\
             s1 -> c; s2 -> c;",
        )
        .err()
        .expect("expected load failure");
        assert!(errors
            .iter()
            .any(|e| matches!(e, RouterError::DuplicateConnection { .. })));
    }

    #[test]
    fn test_unconnected_ports_rejected() {
        let errors = build("c :: Counter;").err().expect("expected load failure");
        let unconnected = errors
            .iter()
            .filter(|e| matches!(e, RouterError::Unconnected { .. }))
            .count();
        assert_eq!(unconnected, 2);
    }

    #[test]
    fn test_port_out_of_class_range() {
        let errors = build("s :: InfiniteSource; s [1] -> Discard; s -> Discard;")
            .err()
            .expect("expected load failure");
        assert!(errors
            .iter()
            .any(|e| matches!(e, RouterError::PortCount { .. })));
    }

    #[test]
    fn test_configure_errors_accumulate() {
        let errors = build(
            "q :: Queue(0); l :: LinkUnqueue(BANDWIDTH 0);\n\
             InfiniteSource -> q -> l -> Discard;",
        )
        .err()
        .expect("expected load failure");
        let configure = errors
            .iter()
            .filter(|e| matches!(e, RouterError::Configure { .. }))
            .count();
        assert_eq!(configure, 2);
    }

    #[test]
    fn test_handler_namespace() {
        let router = build_ok("src :: InfiniteSource; cnt :: Counter; src -> cnt -> Discard;");
        assert_eq!(router.call_read("cnt.count").unwrap(), "0");
        assert_eq!(router.call_read("cnt.class").unwrap(), "Counter");
        assert!(!router.call_read("version").unwrap().is_empty());

        assert!(matches!(
            router.call_read("cnt.nope"),
            Err(HandlerError::NoHandler(_))
        ));
        assert!(matches!(
            router.call_read("ghost.count"),
            Err(HandlerError::NoHandler(_)) | Err(HandlerError::NoElement(_))
        ));
        // a read-only handler refuses writes
        assert!(matches!(
            router.call_write("cnt.count", "3"),
            Err(HandlerError::NotWritable(_))
        ));
    }

    #[test]
    fn test_stop_handler_sets_runcount() {
        let router = build_ok("src :: InfiniteSource; src -> Discard;");
        router.activate();
        assert!(router.runcount() > 0);
        router.call_write("stop", "").unwrap();
        assert_eq!(router.runcount(), STOP_RUNCOUNT);
    }

    #[test]
    fn test_pattern_expansion_matches_exact_glob_and_class() {
        let router = build_ok(
            "s1, s2 :: InfiniteSource; c1, c2 :: Counter;\n\
             s1 -> c1 -> Discard; s2 -> c2 -> Discard;",
        );
        assert_eq!(router.expand_pattern("c1").len(), 1);
        assert_eq!(router.expand_pattern("c[12]").len(), 2);
        assert_eq!(router.expand_pattern("class:Counter").len(), 2);
        assert_eq!(router.expand_pattern("Counter").len(), 2);
        assert!(router.expand_pattern("nothing*here").is_empty());
    }

    #[test]
    fn test_push_chain_counts_synchronously() {
        let router = build_ok("src :: InfiniteSource; cnt :: Counter; src -> cnt -> Discard;");
        let src = router.find("src").unwrap();
        let ports = Ports::new(&router, src);
        for _ in 0..5 {
            ports.push(0, Packet::new(b"data"));
        }
        assert_eq!(router.call_read("cnt.count").unwrap(), "5");
        let discard = router.find("Discard@1").unwrap();
        let sink = router
            .element(discard)
            .as_any()
            .downcast_ref::<crate::elements::Discard>()
            .unwrap();
        assert_eq!(sink.count(), 5);
    }
}
