//! Statement parser and compound-class expansion.
//!
//! Parsing produces a flat declaration list and connection list.
//! Compound classes expand by alpha-renaming: an instance `c` of
//! `elementclass F { ... }` contributes its body elements under
//! `c/name`, and its `input`/`output` pseudoports are spliced out of
//! the connection list, so the result is always a plain element graph.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::{ConfigError, Landmark, Token, TokenKind};

/// Features the engine itself provides to `require()` statements.
const PROVISIONS: &[&str] = &["weft", "userlevel"];

/// How many splice steps compound rewiring may take before we call
/// the configuration degenerate.
const MAX_SPLICE_PASSES: usize = 100_000;

#[derive(Debug, Clone)]
pub struct ElementDecl {
    pub name: String,
    pub class: String,
    pub config: String,
    pub landmark: Landmark,
}

#[derive(Debug, Clone)]
pub struct ConnDecl {
    pub from: String,
    pub from_port: usize,
    pub to: String,
    pub to_port: usize,
    pub landmark: Landmark,
}

/// Result of a parse: the fully expanded element graph plus the
/// requirements the text asserted.
#[derive(Debug, Default)]
pub struct ParsedConfig {
    pub elements: Vec<ElementDecl>,
    pub connections: Vec<ConnDecl>,
    pub requirements: Vec<String>,
}

struct Compound {
    params: Vec<String>,
    body: Vec<Vec<Token>>,
}

/// Pseudoport arity of one expanded compound instance.
struct Instance {
    ninputs: usize,
    noutputs: usize,
}

/// What pass 1 learned about a declared name.
#[derive(Clone)]
struct DeclInfo {
    class: String,
    config: String,
}

pub fn parse_string(
    text: &str,
    filename: &str,
    classes: &HashSet<String>,
    defines: &HashMap<String, String>,
) -> Result<ParsedConfig, Vec<ConfigError>> {
    let tokens = super::tokenize(text, filename).map_err(|e| vec![e])?;
    let statements = split_statements(&tokens);

    let mut parser = Parser {
        classes,
        compounds: HashMap::new(),
        anon_seq: 0,
        depth: 0,
        errors: Vec::new(),
    };
    let mut scope = Scope::new(defines.clone());

    parser.parse_scope(&statements, &mut scope);
    parser.splice_instances(&mut scope);

    if parser.errors.is_empty() {
        Ok(scope.out)
    } else {
        Err(parser.errors)
    }
}

/// Split a token stream into statements at top-level semicolons.
/// Braces group, so an `elementclass` body is one statement.
fn split_statements(tokens: &[Token]) -> Vec<Vec<Token>> {
    let mut out = Vec::new();
    let mut cur: Vec<Token> = Vec::new();
    let mut depth = 0usize;
    for t in tokens {
        match t.kind {
            TokenKind::OpenBrace => {
                depth += 1;
                cur.push(t.clone());
            }
            TokenKind::CloseBrace => {
                depth = depth.saturating_sub(1);
                cur.push(t.clone());
            }
            TokenKind::Semicolon if depth == 0 => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            _ => cur.push(t.clone()),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

struct Scope {
    defines: HashMap<String, String>,
    declared: HashMap<String, DeclInfo>,
    out: ParsedConfig,
    instances: HashMap<String, Instance>,
    emitted: HashSet<String>,
}

impl Scope {
    fn new(defines: HashMap<String, String>) -> Self {
        Scope {
            defines,
            declared: HashMap::new(),
            out: ParsedConfig::default(),
            instances: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    fn new_compound_body(defines: HashMap<String, String>) -> Self {
        let mut scope = Scope::new(defines);
        for pseudo in ["input", "output"] {
            scope.declared.insert(
                pseudo.to_string(),
                DeclInfo {
                    class: "@pseudo".to_string(),
                    config: String::new(),
                },
            );
        }
        scope
    }
}

struct Parser<'a> {
    classes: &'a HashSet<String>,
    compounds: HashMap<String, Compound>,
    anon_seq: usize,
    depth: usize,
    errors: Vec<ConfigError>,
}

/// Compound bodies may nest, but never this deep; deeper means a
/// class instantiates itself.
const MAX_EXPANSION_DEPTH: usize = 50;

impl<'a> Parser<'a> {
    fn parse_scope(&mut self, statements: &[Vec<Token>], scope: &mut Scope) {
        // pass 1: collect every `name :: Class(config)` so chains may
        // reference elements declared later in the text
        for stmt in statements {
            self.scan_declarations(stmt, scope);
        }

        // pass 2: emit in first-mention order
        for stmt in statements {
            self.parse_statement(stmt, scope);
        }
    }

    fn scan_declarations(&mut self, stmt: &[Token], scope: &mut Scope) {
        if let Some(Token {
            kind: TokenKind::Ident(word),
            ..
        }) = stmt.first()
        {
            if word == "elementclass" || word == "define" || word == "require" {
                return;
            }
        }
        for i in 0..stmt.len() {
            if i + 2 >= stmt.len() {
                break;
            }
            if let (TokenKind::Ident(name), TokenKind::DoubleColon, TokenKind::Ident(class)) =
                (&stmt[i].kind, &stmt[i + 1].kind, &stmt[i + 2].kind)
            {
                let config = match stmt.get(i + 3).map(|t| &t.kind) {
                    Some(TokenKind::Config(c)) => c.clone(),
                    _ => String::new(),
                };
                self.declare(name, class, &config, &stmt[i].landmark, scope);
                // `a, b :: Class`: walk back over preceding idents
                let mut j = i;
                while j >= 2
                    && stmt[j - 1].kind == TokenKind::Comma
                    && matches!(stmt[j - 2].kind, TokenKind::Ident(_))
                {
                    if let TokenKind::Ident(prev) = &stmt[j - 2].kind {
                        self.declare(prev, class, &config, &stmt[j - 2].landmark, scope);
                    }
                    j -= 2;
                }
            }
        }
    }

    fn declare(
        &mut self,
        name: &str,
        class: &str,
        config: &str,
        landmark: &Landmark,
        scope: &mut Scope,
    ) {
        if name == "input" || name == "output" {
            self.errors.push(ConfigError::Syntax {
                landmark: landmark.clone(),
                msg: format!("'{}' is a reserved pseudoelement name", name),
            });
            return;
        }
        if scope.declared.contains_key(name) {
            self.errors.push(ConfigError::Redeclared {
                landmark: landmark.clone(),
                name: name.to_string(),
            });
            return;
        }
        scope.declared.insert(
            name.to_string(),
            DeclInfo {
                class: class.to_string(),
                config: config.to_string(),
            },
        );
    }

    fn parse_statement(&mut self, stmt: &[Token], scope: &mut Scope) {
        let first = match stmt.first() {
            Some(t) => t,
            None => return,
        };

        if let TokenKind::Ident(word) = &first.kind {
            match word.as_str() {
                "elementclass" => return self.parse_elementclass(stmt),
                "define" => return self.parse_define(stmt, scope),
                "require" => return self.parse_require(stmt, scope),
                _ => {}
            }
        }

        let has_arrow = stmt.iter().any(|t| t.kind == TokenKind::Arrow);
        if has_arrow {
            self.parse_chain(stmt, scope);
        } else {
            self.parse_declaration(stmt, scope);
        }
    }

    fn parse_elementclass(&mut self, stmt: &[Token]) {
        let landmark = stmt[0].landmark.clone();
        let name = match stmt.get(1).map(|t| &t.kind) {
            Some(TokenKind::Ident(n)) => n.clone(),
            _ => {
                return self.errors.push(ConfigError::Syntax {
                    landmark,
                    msg: "'elementclass' expects a class name".into(),
                })
            }
        };
        if !matches!(stmt.get(2).map(|t| &t.kind), Some(TokenKind::OpenBrace))
            || !matches!(stmt.last().map(|t| &t.kind), Some(TokenKind::CloseBrace))
        {
            return self.errors.push(ConfigError::Syntax {
                landmark,
                msg: format!("'elementclass {}' expects a braced body", name),
            });
        }

        let mut body = &stmt[3..stmt.len() - 1];
        // optional parameter list: `$a, $b | ...`
        let mut params = Vec::new();
        if let Some(bar) = body.iter().position(|t| t.kind == TokenKind::Bar) {
            let head = &body[..bar];
            let ok = !head.is_empty()
                && head.iter().enumerate().all(|(i, t)| {
                    if i % 2 == 0 {
                        matches!(t.kind, TokenKind::Variable(_))
                    } else {
                        t.kind == TokenKind::Comma
                    }
                });
            if ok {
                for t in head {
                    if let TokenKind::Variable(v) = &t.kind {
                        params.push(v.clone());
                    }
                }
                body = &body[bar + 1..];
            } else {
                return self.errors.push(ConfigError::Syntax {
                    landmark,
                    msg: format!("bad parameter list in 'elementclass {}'", name),
                });
            }
        }

        if self.compounds.contains_key(&name) || self.classes.contains(&name) {
            debug!(class = %name, "elementclass shadows an existing class");
        }
        self.compounds.insert(
            name,
            Compound {
                params,
                body: split_statements(body),
            },
        );
    }

    fn parse_define(&mut self, stmt: &[Token], scope: &mut Scope) {
        let landmark = stmt[0].landmark.clone();
        let config = match stmt.get(1).map(|t| &t.kind) {
            Some(TokenKind::Config(c)) => c.clone(),
            _ => {
                return self.errors.push(ConfigError::Syntax {
                    landmark,
                    msg: "'define' expects a parenthesized list".into(),
                })
            }
        };
        for piece in crate::args::split_args(&config) {
            if piece.is_empty() {
                continue;
            }
            let Some(rest) = piece.strip_prefix('$') else {
                self.errors.push(ConfigError::Syntax {
                    landmark: landmark.clone(),
                    msg: format!("'define' entries look like '$name value', not '{}'", piece),
                });
                continue;
            };
            let (name, value) = match rest.find(char::is_whitespace) {
                Some(i) => (&rest[..i], rest[i..].trim_start()),
                None => (rest, ""),
            };
            // command-line parameters take precedence over config text
            if !scope.defines.contains_key(name) {
                scope.defines.insert(name.to_string(), value.to_string());
            } else {
                debug!(param = %name, "define shadowed by existing parameter");
            }
        }
    }

    fn parse_require(&mut self, stmt: &[Token], scope: &mut Scope) {
        let landmark = stmt[0].landmark.clone();
        let config = match stmt.get(1).map(|t| &t.kind) {
            Some(TokenKind::Config(c)) => c.clone(),
            _ => {
                return self.errors.push(ConfigError::Syntax {
                    landmark,
                    msg: "'require' expects a parenthesized list".into(),
                })
            }
        };
        for piece in crate::args::split_args(&config) {
            if piece.is_empty() {
                continue;
            }
            if !PROVISIONS.contains(&piece.as_str()) {
                self.errors.push(ConfigError::Requirement {
                    landmark: landmark.clone(),
                    what: piece.clone(),
                });
            }
            scope.out.requirements.push(piece);
        }
    }

    /// A statement without `->`: `a, b :: Class(config)`, a bare
    /// `Class(config)` anonymous instance, or a bare reference.
    fn parse_declaration(&mut self, stmt: &[Token], scope: &mut Scope) {
        let landmark = stmt[0].landmark.clone();

        // `Class(config)` or bare `Class` / bare `name`
        if stmt.len() <= 2 {
            if let Some(TokenKind::Ident(ident)) = stmt.first().map(|t| &t.kind) {
                let ident = ident.clone();
                match stmt.get(1).map(|t| &t.kind) {
                    None => {
                        if let Some(info) = scope.declared.get(&ident).cloned() {
                            if info.class != "@pseudo" {
                                self.emit_element(
                                    Some(&ident),
                                    &info.class,
                                    &info.config,
                                    &landmark,
                                    scope,
                                );
                            }
                        } else if self.is_class(&ident) {
                            self.emit_element(None, &ident, "", &landmark, scope);
                        } else {
                            self.errors.push(ConfigError::Unknown {
                                landmark,
                                name: ident,
                            });
                        }
                        return;
                    }
                    Some(TokenKind::Config(c)) => {
                        let config = c.clone();
                        self.emit_element(None, &ident, &config, &landmark, scope);
                        return;
                    }
                    _ => {}
                }
            }
        }

        // `a, b :: Class(config)`
        let mut names = Vec::new();
        let mut i = 0;
        loop {
            match stmt.get(i).map(|t| &t.kind) {
                Some(TokenKind::Ident(n)) => names.push(n.clone()),
                _ => {
                    return self.errors.push(ConfigError::Syntax {
                        landmark,
                        msg: "expected element name".into(),
                    })
                }
            }
            match stmt.get(i + 1).map(|t| &t.kind) {
                Some(TokenKind::Comma) => i += 2,
                Some(TokenKind::DoubleColon) => {
                    i += 2;
                    break;
                }
                _ => {
                    return self.errors.push(ConfigError::Syntax {
                        landmark,
                        msg: "expected ',' or '::' in declaration".into(),
                    })
                }
            }
        }

        let class = match stmt.get(i).map(|t| &t.kind) {
            Some(TokenKind::Ident(c)) => c.clone(),
            _ => {
                return self.errors.push(ConfigError::Syntax {
                    landmark,
                    msg: "expected class name after '::'".into(),
                })
            }
        };
        let config = match stmt.get(i + 1).map(|t| &t.kind) {
            Some(TokenKind::Config(c)) => {
                i += 1;
                c.clone()
            }
            _ => String::new(),
        };
        if i + 1 < stmt.len() {
            self.errors.push(ConfigError::Syntax {
                landmark: stmt[i + 1].landmark.clone(),
                msg: "unexpected tokens after declaration".into(),
            });
            return;
        }
        for name in names {
            self.emit_element(Some(&name), &class, &config, &landmark, scope);
        }
    }

    fn is_class(&self, name: &str) -> bool {
        self.compounds.contains_key(name) || self.classes.contains(name)
    }

    /// Emit one element (or expand one compound instance), once.
    /// With `name: None` a unique anonymous name is generated.
    /// Returns the instance name.
    fn emit_element(
        &mut self,
        name: Option<&str>,
        class: &str,
        config: &str,
        landmark: &Landmark,
        scope: &mut Scope,
    ) -> String {
        let name = match name {
            Some(n) => n.to_string(),
            None => {
                self.anon_seq += 1;
                let n = format!("{}@{}", class, self.anon_seq);
                scope.declared.insert(
                    n.clone(),
                    DeclInfo {
                        class: class.to_string(),
                        config: config.to_string(),
                    },
                );
                n
            }
        };
        if scope.emitted.contains(&name) {
            return name;
        }
        scope.emitted.insert(name.clone());

        let config = match substitute(config, &scope.defines, landmark) {
            Ok(c) => c,
            Err(e) => {
                self.errors.push(e);
                String::new()
            }
        };

        if self.compounds.contains_key(class) {
            self.expand_compound(&name, class, &config, landmark, scope);
        } else if self.classes.contains(class) {
            scope.out.elements.push(ElementDecl {
                name: name.clone(),
                class: class.to_string(),
                config,
                landmark: landmark.clone(),
            });
        } else {
            self.errors.push(ConfigError::Unknown {
                landmark: landmark.clone(),
                name: class.to_string(),
            });
        }
        name
    }

    fn expand_compound(
        &mut self,
        instance: &str,
        class: &str,
        config: &str,
        landmark: &Landmark,
        scope: &mut Scope,
    ) {
        if self.depth >= MAX_EXPANSION_DEPTH {
            self.errors.push(ConfigError::Syntax {
                landmark: landmark.clone(),
                msg: format!("compound '{}' expands into itself", class),
            });
            return;
        }
        self.depth += 1;

        let compound = &self.compounds[class];
        let params = compound.params.clone();
        let body: Vec<Vec<Token>> = compound.body.clone();

        // bind arguments to declared parameters, positionally or by
        // `name value` keyword
        let mut defines = scope.defines.clone();
        let mut positional = 0usize;
        for piece in crate::args::split_args(config) {
            if piece.is_empty() {
                continue;
            }
            let by_name = params.iter().find(|p| {
                piece
                    .strip_prefix(p.as_str())
                    .map(|rest| rest.starts_with(char::is_whitespace))
                    .unwrap_or(false)
            });
            if let Some(p) = by_name {
                let value = piece[p.len()..].trim_start().to_string();
                defines.insert(p.clone(), value);
            } else if positional < params.len() {
                defines.insert(params[positional].clone(), piece.clone());
                positional += 1;
            } else {
                self.errors.push(ConfigError::Syntax {
                    landmark: landmark.clone(),
                    msg: format!(
                        "compound '{}' takes {} parameter(s), got extra '{}'",
                        class,
                        params.len(),
                        piece
                    ),
                });
            }
        }

        // parse the body in a child scope, then graft it in under
        // `instance/` names
        let mut child = Scope::new_compound_body(defines);
        self.parse_scope(&body, &mut child);
        self.splice_instances(&mut child);

        let rename = |n: &str| format!("{}/{}", instance, n);
        let mut ninputs = 0usize;
        let mut noutputs = 0usize;
        for e in child.out.elements {
            scope.out.elements.push(ElementDecl {
                name: rename(&e.name),
                ..e
            });
        }
        for c in child.out.connections {
            if c.from == "input" {
                ninputs = ninputs.max(c.from_port + 1);
            }
            if c.to == "output" {
                noutputs = noutputs.max(c.to_port + 1);
            }
            scope.out.connections.push(ConnDecl {
                from: rename(&c.from),
                to: rename(&c.to),
                ..c
            });
        }
        scope.out.requirements.extend(child.out.requirements);
        scope
            .instances
            .insert(instance.to_string(), Instance { ninputs, noutputs });
        self.depth -= 1;
    }

    /// One endpoint of a chain: optional input port, element reference
    /// (possibly an inline or anonymous declaration), optional output
    /// port.
    fn parse_endpoint(
        &mut self,
        stmt: &[Token],
        pos: &mut usize,
        scope: &mut Scope,
    ) -> Option<(String, Option<usize>, Option<usize>)> {
        let mut in_port = None;
        let mut out_port = None;

        if matches!(stmt.get(*pos).map(|t| &t.kind), Some(TokenKind::OpenBracket)) {
            in_port = Some(self.parse_port(stmt, pos)?);
        }

        let landmark = stmt.get(*pos).map(|t| t.landmark.clone())?;
        let ident = match stmt.get(*pos).map(|t| &t.kind) {
            Some(TokenKind::Ident(n)) => n.clone(),
            _ => {
                self.errors.push(ConfigError::Syntax {
                    landmark,
                    msg: "expected element reference".into(),
                });
                return None;
            }
        };
        *pos += 1;

        let name = if matches!(stmt.get(*pos).map(|t| &t.kind), Some(TokenKind::DoubleColon)) {
            // inline declaration: `name :: Class(config)`
            *pos += 1;
            let class = match stmt.get(*pos).map(|t| &t.kind) {
                Some(TokenKind::Ident(c)) => c.clone(),
                _ => {
                    self.errors.push(ConfigError::Syntax {
                        landmark,
                        msg: "expected class name after '::'".into(),
                    });
                    return None;
                }
            };
            *pos += 1;
            let config = match stmt.get(*pos).map(|t| &t.kind) {
                Some(TokenKind::Config(c)) => {
                    *pos += 1;
                    c.clone()
                }
                _ => String::new(),
            };
            self.emit_element(Some(&ident), &class, &config, &landmark, scope)
        } else if let Some(TokenKind::Config(c)) = stmt.get(*pos).map(|t| &t.kind) {
            // anonymous: `Class(config)`
            let config = c.clone();
            *pos += 1;
            self.emit_element(None, &ident, &config, &landmark, scope)
        } else if let Some(info) = scope.declared.get(&ident).cloned() {
            // referencing a declared element (or pseudoport)
            if info.class != "@pseudo" {
                self.emit_element(Some(&ident), &info.class, &info.config, &landmark, scope);
            }
            ident
        } else if self.is_class(&ident) {
            // bare anonymous class reference
            self.emit_element(None, &ident, "", &landmark, scope)
        } else {
            self.errors.push(ConfigError::Unknown {
                landmark,
                name: ident,
            });
            return None;
        };

        if matches!(stmt.get(*pos).map(|t| &t.kind), Some(TokenKind::OpenBracket)) {
            out_port = Some(self.parse_port(stmt, pos)?);
        }

        Some((name, in_port, out_port))
    }

    fn parse_port(&mut self, stmt: &[Token], pos: &mut usize) -> Option<usize> {
        let landmark = stmt[*pos].landmark.clone();
        *pos += 1; // '['
        let n = match stmt.get(*pos).map(|t| &t.kind) {
            Some(TokenKind::Number(n)) => *n,
            _ => {
                self.errors.push(ConfigError::Syntax {
                    landmark,
                    msg: "expected port number after '['".into(),
                });
                return None;
            }
        };
        *pos += 1;
        if !matches!(
            stmt.get(*pos).map(|t| &t.kind),
            Some(TokenKind::CloseBracket)
        ) {
            self.errors.push(ConfigError::Syntax {
                landmark,
                msg: "expected ']' after port number".into(),
            });
            return None;
        }
        *pos += 1;
        Some(n)
    }

    /// `a [1] -> [0] b -> c` — a chain of connections.
    fn parse_chain(&mut self, stmt: &[Token], scope: &mut Scope) {
        let mut pos = 0usize;
        let landmark = stmt[0].landmark.clone();

        let Some((mut prev_name, _, mut prev_out)) = self.parse_endpoint(stmt, &mut pos, scope)
        else {
            return;
        };

        let mut any = false;
        while matches!(stmt.get(pos).map(|t| &t.kind), Some(TokenKind::Arrow)) {
            let arrow_landmark = stmt[pos].landmark.clone();
            pos += 1;
            let Some((name, in_port, out_port)) = self.parse_endpoint(stmt, &mut pos, scope)
            else {
                return;
            };
            scope.out.connections.push(ConnDecl {
                from: prev_name,
                from_port: prev_out.unwrap_or(0),
                to: name.clone(),
                to_port: in_port.unwrap_or(0),
                landmark: arrow_landmark,
            });
            prev_name = name;
            prev_out = out_port;
            any = true;
        }

        if !any {
            self.errors.push(ConfigError::Syntax {
                landmark,
                msg: "expected '->' in connection".into(),
            });
        }
        if pos != stmt.len() {
            self.errors.push(ConfigError::Syntax {
                landmark: stmt[pos].landmark.clone(),
                msg: "unexpected tokens after connection".into(),
            });
        }
    }

    /// Remove compound instances from the connection list by joining
    /// outer edges with the instance's `input`/`output` pseudoport
    /// edges.
    fn splice_instances(&mut self, scope: &mut Scope) {
        if scope.instances.is_empty() {
            return;
        }

        let mut steps = 0usize;
        loop {
            steps += 1;
            if steps > MAX_SPLICE_PASSES {
                if let Some(c) = scope.out.connections.first() {
                    self.errors.push(ConfigError::Syntax {
                        landmark: c.landmark.clone(),
                        msg: "compound element wiring does not terminate".into(),
                    });
                }
                break;
            }
            let idx = scope.out.connections.iter().position(|c| {
                scope.instances.contains_key(&c.to) || scope.instances.contains_key(&c.from)
            });
            let Some(idx) = idx else { break };
            let conn = scope.out.connections.remove(idx);

            if let Some(inst) = scope.instances.get(&conn.to) {
                // join with inner `inst/input [port] -> X`
                if conn.to_port >= inst.ninputs {
                    self.errors.push(ConfigError::BadPseudoPort {
                        landmark: conn.landmark.clone(),
                        class: conn.to.clone(),
                        port: "input",
                        index: conn.to_port,
                    });
                    continue;
                }
                let pseudo = format!("{}/input", conn.to);
                let joins: Vec<ConnDecl> = scope
                    .out
                    .connections
                    .iter()
                    .filter(|d| d.from == pseudo && d.from_port == conn.to_port)
                    .cloned()
                    .collect();
                if joins.is_empty() {
                    self.errors.push(ConfigError::BadPseudoPort {
                        landmark: conn.landmark.clone(),
                        class: conn.to.clone(),
                        port: "input",
                        index: conn.to_port,
                    });
                    continue;
                }
                for d in joins {
                    scope.out.connections.push(ConnDecl {
                        from: conn.from.clone(),
                        from_port: conn.from_port,
                        to: d.to,
                        to_port: d.to_port,
                        landmark: conn.landmark.clone(),
                    });
                }
            } else if let Some(inst) = scope.instances.get(&conn.from) {
                // join with inner `X -> [port] inst/output`
                if conn.from_port >= inst.noutputs {
                    self.errors.push(ConfigError::BadPseudoPort {
                        landmark: conn.landmark.clone(),
                        class: conn.from.clone(),
                        port: "output",
                        index: conn.from_port,
                    });
                    continue;
                }
                let pseudo = format!("{}/output", conn.from);
                let joins: Vec<ConnDecl> = scope
                    .out
                    .connections
                    .iter()
                    .filter(|d| d.to == pseudo && d.to_port == conn.from_port)
                    .cloned()
                    .collect();
                if joins.is_empty() {
                    self.errors.push(ConfigError::BadPseudoPort {
                        landmark: conn.landmark.clone(),
                        class: conn.from.clone(),
                        port: "output",
                        index: conn.from_port,
                    });
                    continue;
                }
                for d in joins {
                    scope.out.connections.push(ConnDecl {
                        from: d.from,
                        from_port: d.from_port,
                        to: conn.to.clone(),
                        to_port: conn.to_port,
                        landmark: conn.landmark.clone(),
                    });
                }
            }
        }

        // pseudoport edges have served their purpose
        let instances = &scope.instances;
        scope.out.connections.retain(|c| {
            let is_pseudo = |n: &str| {
                n.rsplit_once('/').map_or(false, |(head, tail)| {
                    (tail == "input" || tail == "output") && instances.contains_key(head)
                })
            };
            !is_pseudo(&c.from) && !is_pseudo(&c.to)
        });
    }
}

/// Replace `$name` references with their definitions.
fn substitute(
    text: &str,
    defines: &HashMap<String, String>,
    landmark: &Landmark,
) -> Result<String, ConfigError> {
    if !text.contains('$') {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        rest = &rest[dollar + 1..];
        let end = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        if end == 0 {
            out.push('$');
            continue;
        }
        let name = &rest[..end];
        match defines.get(name) {
            Some(value) => out.push_str(value),
            None => {
                return Err(ConfigError::UndefinedParameter {
                    landmark: landmark.clone(),
                    name: name.to_string(),
                })
            }
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> HashSet<String> {
        ["InfiniteSource", "Counter", "Queue", "Discard", "Idle"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn parse(text: &str) -> ParsedConfig {
        parse_string(text, "test", &classes(), &HashMap::new())
            .unwrap_or_else(|e| panic!("parse failed: {:?}", e))
    }

    fn parse_err(text: &str) -> Vec<ConfigError> {
        parse_string(text, "test", &classes(), &HashMap::new())
            .err()
            .expect("expected parse errors")
    }

    #[test]
    fn test_declaration_and_chain() {
        let cfg = parse("src :: InfiniteSource(LENGTH 64);\nsrc -> Counter -> Discard;");
        assert_eq!(cfg.elements.len(), 3);
        assert_eq!(cfg.elements[0].name, "src");
        assert_eq!(cfg.elements[0].config, "LENGTH 64");
        assert_eq!(cfg.connections.len(), 2);
        assert_eq!(cfg.connections[0].from, "src");
        // anonymous elements get generated names
        assert!(cfg.connections[0].to.starts_with("Counter@"));
    }

    #[test]
    fn test_multi_name_declaration() {
        let cfg = parse("c1, c2 :: Counter; c1 -> c2;");
        assert_eq!(cfg.elements.len(), 2);
        assert_eq!(cfg.elements[1].name, "c2");
        assert_eq!(cfg.elements[1].class, "Counter");
    }

    #[test]
    fn test_forward_reference_keeps_config() {
        let cfg = parse("a -> q; q :: Queue(17); a :: InfiniteSource;");
        assert_eq!(cfg.connections.len(), 1);
        assert_eq!(cfg.connections[0].to, "q");
        let q = cfg.elements.iter().find(|e| e.name == "q").unwrap();
        assert_eq!(q.config, "17");
    }

    #[test]
    fn test_inline_declaration_in_chain() {
        let cfg = parse("InfiniteSource -> q :: Queue(8) -> Discard;");
        let q = cfg.elements.iter().find(|e| e.name == "q").unwrap();
        assert_eq!(q.class, "Queue");
        assert_eq!(q.config, "8");
    }

    #[test]
    fn test_bare_anonymous_statement() {
        let cfg = parse("Idle; Queue(4);");
        assert_eq!(cfg.elements.len(), 2);
        assert_eq!(cfg.elements[1].config, "4");
    }

    #[test]
    fn test_ports() {
        let cfg = parse("a :: Counter; b :: Counter; a [1] -> [2] b;");
        let c = &cfg.connections[0];
        assert_eq!((c.from_port, c.to_port), (1, 2));
    }

    #[test]
    fn test_unknown_class_reported_with_landmark() {
        let errs = parse_err("x :: NoSuchThing;");
        assert!(matches!(errs[0], ConfigError::Unknown { .. }));
        assert!(errs[0].to_string().contains("test:1"));
    }

    #[test]
    fn test_redeclaration_rejected() {
        let errs = parse_err("a :: Counter; a :: Queue;");
        assert!(errs
            .iter()
            .any(|e| matches!(e, ConfigError::Redeclared { .. })));
    }

    #[test]
    fn test_define_substitution() {
        let cfg = parse("define($len 128); s :: InfiniteSource(LENGTH $len);");
        assert_eq!(cfg.elements[0].config, "LENGTH 128");
    }

    #[test]
    fn test_undefined_parameter() {
        let errs = parse_err("s :: InfiniteSource(LENGTH $nope);");
        assert!(matches!(errs[0], ConfigError::UndefinedParameter { .. }));
    }

    #[test]
    fn test_require() {
        let cfg = parse("require(weft); Idle;");
        assert_eq!(cfg.requirements, vec!["weft"]);
        let errs = parse_err("require(kernel_module);");
        assert!(matches!(errs[0], ConfigError::Requirement { .. }));
    }

    #[test]
    fn test_compound_expansion() {
        let cfg = parse(
            "elementclass Pipe { input -> Counter -> output };\n\
             s :: InfiniteSource; p :: Pipe; s -> p -> Discard;",
        );
        // the compound body contributes a renamed counter
        let counter = cfg.elements.iter().find(|e| e.class == "Counter").unwrap();
        assert!(counter.name.starts_with("p/"));
        // and the instance is spliced out of the connection list
        assert!(cfg.connections.iter().all(|c| c.from != "p" && c.to != "p"));
        let into = cfg.connections.iter().find(|c| c.from == "s").unwrap();
        assert_eq!(into.to, counter.name);
    }

    #[test]
    fn test_compound_parameters() {
        let cfg = parse(
            "elementclass Gen { $len | InfiniteSource(LENGTH $len) -> output };\n\
             g :: Gen(256); g -> Discard;",
        );
        let src = cfg
            .elements
            .iter()
            .find(|e| e.class == "InfiniteSource")
            .unwrap();
        assert_eq!(src.config, "LENGTH 256");
    }

    #[test]
    fn test_compound_keyword_parameter() {
        let cfg = parse(
            "elementclass Gen { $len | InfiniteSource(LENGTH $len) -> output };\n\
             g :: Gen(len 512); g -> Discard;",
        );
        let src = cfg
            .elements
            .iter()
            .find(|e| e.class == "InfiniteSource")
            .unwrap();
        assert_eq!(src.config, "LENGTH 512");
    }

    #[test]
    fn test_compound_passthrough() {
        let cfg = parse(
            "elementclass Wire { input -> output };\n\
             s :: InfiniteSource; s -> Wire -> Discard;",
        );
        assert_eq!(cfg.connections.len(), 1);
        assert_eq!(cfg.connections[0].from, "s");
        assert!(cfg.connections[0].to.starts_with("Discard@"));
    }

    #[test]
    fn test_compound_bad_port() {
        let errs = parse_err(
            "elementclass Pipe { input -> Counter -> output };\n\
             s :: InfiniteSource; s -> [3] Pipe -> Discard;",
        );
        assert!(errs
            .iter()
            .any(|e| matches!(e, ConfigError::BadPseudoPort { .. })));
    }

    #[test]
    fn test_nested_compounds() {
        let cfg = parse(
            "elementclass Inner { input -> Counter -> output };\n\
             elementclass Outer { input -> Inner -> output };\n\
             s :: InfiniteSource; s -> Outer -> Discard;",
        );
        let counter = cfg.elements.iter().find(|e| e.class == "Counter").unwrap();
        assert!(counter.name.contains('/'));
        assert_eq!(cfg.connections.len(), 2);
    }
}
