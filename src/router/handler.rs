//! Handler registry: per-element named read/write endpoints.
//!
//! Handlers are addressable as `element.name`; a bare `name` denotes a
//! router-global handler on the root. The registry is concurrent so
//! control threads read it while driver threads run; exclusivity is a
//! per-element lock taken around handler calls unless the handler is
//! flagged NONEXCLUSIVE.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::element::{Element, ElementIndex};
use crate::router::Router;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no element matching '{0}'")]
    NoElement(String),

    #[error("no '{0}' handler")]
    NoHandler(String),

    #[error("'{0}' is a write handler")]
    NotReadable(String),

    #[error("'{0}' is a read handler")]
    NotWritable(String),

    #[error("{0}")]
    Message(String),
}

impl HandlerError {
    pub fn message(msg: impl Into<String>) -> Self {
        HandlerError::Message(msg.into())
    }
}

/// RAW suppresses the display newline; NONEXCLUSIVE skips the
/// per-element lock so the handler may run concurrently with others
/// on the same element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerFlags {
    pub raw: bool,
    pub nonexclusive: bool,
}

impl HandlerFlags {
    pub const RAW: HandlerFlags = HandlerFlags {
        raw: true,
        nonexclusive: false,
    };
    pub const NONEXCLUSIVE: HandlerFlags = HandlerFlags {
        raw: false,
        nonexclusive: true,
    };
    pub const RAW_NONEXCLUSIVE: HandlerFlags = HandlerFlags {
        raw: true,
        nonexclusive: true,
    };
}

/// What a handler body gets to see.
pub struct HandlerArgs<'a> {
    pub element: Option<&'a dyn Element>,
    pub router: &'a Router,
}

pub(crate) type ReadFn =
    Arc<dyn Fn(&HandlerArgs<'_>) -> Result<String, HandlerError> + Send + Sync>;
pub(crate) type WriteFn =
    Arc<dyn Fn(&HandlerArgs<'_>, &str) -> Result<(), HandlerError> + Send + Sync>;

pub struct Handler {
    element: Option<ElementIndex>,
    name: String,
    flags: HandlerFlags,
    read: Option<ReadFn>,
    write: Option<WriteFn>,
}

impl Handler {
    pub fn element(&self) -> Option<ElementIndex> {
        self.element
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> bool {
        self.flags.raw
    }

    pub fn nonexclusive(&self) -> bool {
        self.flags.nonexclusive
    }

    pub fn readable(&self) -> bool {
        self.read.is_some()
    }

    pub fn writable(&self) -> bool {
        self.write.is_some()
    }

    pub(crate) fn read_fn(&self) -> Option<&ReadFn> {
        self.read.as_ref()
    }

    pub(crate) fn write_fn(&self) -> Option<&WriteFn> {
        self.write.as_ref()
    }
}

/// Keyed `element.handler` for element handlers, bare `handler` for
/// root handlers.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    map: DashMap<String, Arc<Handler>>,
}

impl HandlerRegistry {
    fn key(element_name: Option<&str>, handler: &str) -> String {
        match element_name {
            Some(e) => format!("{}.{}", e, handler),
            None => handler.to_string(),
        }
    }

    pub(crate) fn get(&self, element_name: Option<&str>, handler: &str) -> Option<Arc<Handler>> {
        self.map
            .get(&Self::key(element_name, handler))
            .map(|h| Arc::clone(h.value()))
    }

    /// Install or extend a handler. Registering a read and a write
    /// part under the same name merges them into one handler.
    pub(crate) fn set(
        &self,
        element: Option<ElementIndex>,
        element_name: Option<&str>,
        handler: &str,
        flags: HandlerFlags,
        read: Option<ReadFn>,
        write: Option<WriteFn>,
    ) {
        let key = Self::key(element_name, handler);
        let merged = match self.map.get(&key) {
            Some(existing) => Handler {
                element,
                name: handler.to_string(),
                flags,
                read: read.or_else(|| existing.read.clone()),
                write: write.or_else(|| existing.write.clone()),
            },
            None => Handler {
                element,
                name: handler.to_string(),
                flags,
                read,
                write,
            },
        };
        self.map.insert(key, Arc::new(merged));
    }

    /// Names of every handler on one element (or the root), sorted.
    pub(crate) fn names_for(&self, element_name: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = self
            .map
            .iter()
            .filter_map(|entry| match (element_name, entry.key().split_once('.')) {
                (Some(e), Some((ename, h))) if ename == e => Some(h.to_string()),
                (None, None) => Some(entry.key().clone()),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }
}

/// Passed to [`Element::add_handlers`]; wraps registration with the
/// downcast from `&dyn Element` to the concrete class.
pub struct HandlerBuilder<'a> {
    pub(crate) registry: &'a HandlerRegistry,
    pub(crate) element: ElementIndex,
    pub(crate) element_name: &'a str,
}

impl HandlerBuilder<'_> {
    pub fn read<T, F>(&mut self, name: &str, f: F)
    where
        T: Element + 'static,
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.read_flags(name, HandlerFlags::default(), f)
    }

    pub fn read_flags<T, F>(&mut self, name: &str, flags: HandlerFlags, f: F)
    where
        T: Element + 'static,
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        let read: ReadFn = Arc::new(move |args: &HandlerArgs<'_>| {
            let element = downcast::<T>(args)?;
            Ok(f(element))
        });
        self.registry.set(
            Some(self.element),
            Some(self.element_name),
            name,
            flags,
            Some(read),
            None,
        );
    }

    pub fn write<T, F>(&mut self, name: &str, f: F)
    where
        T: Element + 'static,
        F: Fn(&T, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.write_flags(name, HandlerFlags::default(), f)
    }

    pub fn write_flags<T, F>(&mut self, name: &str, flags: HandlerFlags, f: F)
    where
        T: Element + 'static,
        F: Fn(&T, &str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let write: WriteFn = Arc::new(move |args: &HandlerArgs<'_>, value: &str| {
            let element = downcast::<T>(args)?;
            f(element, value)
        });
        self.registry.set(
            Some(self.element),
            Some(self.element_name),
            name,
            flags,
            None,
            Some(write),
        );
    }
}

fn downcast<'a, T: Element + 'static>(
    args: &'a HandlerArgs<'_>,
) -> Result<&'a T, HandlerError> {
    let element = args
        .element
        .ok_or_else(|| HandlerError::message("handler lost its element"))?;
    element
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| HandlerError::message("handler element class mismatch"))
}

/// Shell-style glob over element names: `*`, `?`, and `[...]`
/// character classes with ranges and leading `^` negation.
pub fn glob_match(text: &str, pattern: &str) -> bool {
    glob_bytes(text.as_bytes(), pattern.as_bytes())
}

fn glob_bytes(text: &[u8], pattern: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            for skip in 0..=text.len() {
                if glob_bytes(&text[skip..], &pattern[1..]) {
                    return true;
                }
            }
            false
        }
        Some(b'?') => !text.is_empty() && glob_bytes(&text[1..], &pattern[1..]),
        Some(b'[') => {
            let Some(close) = pattern.iter().skip(1).position(|&c| c == b']') else {
                // unterminated class matches a literal '['
                return text.first() == Some(&b'[') && glob_bytes(&text[1..], &pattern[1..]);
            };
            let close = close + 1;
            let Some(&c) = text.first() else {
                return false;
            };
            let mut class = &pattern[1..close];
            let negate = class.first() == Some(&b'^');
            if negate {
                class = &class[1..];
            }
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == b'-' {
                    if class[i] <= c && c <= class[i + 2] {
                        hit = true;
                    }
                    i += 3;
                } else {
                    if class[i] == c {
                        hit = true;
                    }
                    i += 1;
                }
            }
            if hit == negate {
                return false;
            }
            glob_bytes(&text[1..], &pattern[close + 1..])
        }
        Some(&c) => text.first() == Some(&c) && glob_bytes(&text[1..], &pattern[1..]),
    }
}

/// True when a pattern would be treated as a glob rather than a plain
/// name.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_star_and_question() {
        assert!(glob_match("counter", "*"));
        assert!(glob_match("counter", "c*r"));
        assert!(glob_match("counter", "c??nter"));
        assert!(!glob_match("counter", "c?nter"));
        assert!(glob_match("", "*"));
        assert!(!glob_match("x", ""));
    }

    #[test]
    fn test_glob_class() {
        assert!(glob_match("cnt1", "cnt[0-9]"));
        assert!(!glob_match("cntx", "cnt[0-9]"));
        assert!(glob_match("cntx", "cnt[^0-9]"));
        assert!(glob_match("a/b", "a/*"));
    }

    #[test]
    fn test_is_glob() {
        assert!(is_glob("cnt*"));
        assert!(is_glob("c[12]"));
        assert!(!is_glob("plain_name"));
    }
}
