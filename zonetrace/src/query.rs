//! Answering the collector's questions
//!
//! Records only carry addresses for static strings and source locations.
//! The worker remembers every address it has sent so it can answer the
//! follow-up `String`/`SourceLocation` queries; anything else is looked up on
//! demand (thread names, symbols, source files).

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use zonetrace_common::{QueryKind, RecordType, ServerQuery};

use crate::event::{str_handle, Event, SourceLocation};
use crate::symbolization::{BacktraceResolver, ResolverFactory, SymbolResolver};
use crate::wire::RecordEncoder;

/// Text sent for a string handle the worker never saw
pub const UNKNOWN_STRING: &str = "???";

/// Largest source file sent in answer to a `SourceCode` query
pub const SOURCE_CODE_LIMIT: u64 = 4 * 1024 * 1024;

/// Application hook for `Parameter` queries: `(index, value)`
pub type ParameterCallback = Arc<dyn Fn(u32, i32) + Send + Sync>;

/// What the worker should do after a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Continue,
    /// Collector is leaving; end the session
    Disconnect,
    /// Collector acknowledged the end of the data
    Terminate,
}

/// Static strings and source locations that went out on the wire
#[derive(Debug, Default)]
pub struct Registry {
    strings: HashMap<u64, &'static str>,
    srclocs: HashMap<u64, &'static SourceLocation>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_event(&mut self, event: &Event) {
        let (strings, srclocs) = (&mut self.strings, &mut self.srclocs);
        event.visit_statics(
            |s| {
                strings.insert(str_handle(s), s);
            },
            |loc| {
                srclocs.insert(loc.handle(), loc);
            },
        );
    }

    pub fn register_str(&mut self, s: &'static str) {
        self.strings.insert(str_handle(s), s);
    }

    /// Register a location and the strings its record refers to
    pub fn register_srcloc(&mut self, loc: &'static SourceLocation) {
        self.srclocs.insert(loc.handle(), loc);
        if let Some(name) = loc.name {
            self.register_str(name);
        }
        self.register_str(loc.function);
        self.register_str(loc.file);
    }

    #[must_use]
    pub fn string(&self, handle: u64) -> Option<&'static str> {
        self.strings.get(&handle).copied()
    }

    #[must_use]
    pub fn srcloc(&self, handle: u64) -> Option<&'static SourceLocation> {
        self.srclocs.get(&handle).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len() + self.srclocs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.srclocs.is_empty()
    }
}

/// Names given to threads by the application
#[derive(Debug, Default)]
pub struct ThreadNames(Mutex<HashMap<u32, String>>);

impl ThreadNames {
    pub fn set(&self, thread: u32, name: impl Into<String>) {
        self.0.lock().insert(thread, name.into());
    }

    #[must_use]
    pub fn get(&self, thread: u32) -> Option<String> {
        self.0.lock().get(&thread).cloned()
    }

    /// Registered name, or `thread <tid>`
    #[must_use]
    pub fn name_or_default(&self, thread: u32) -> String {
        self.get(thread).unwrap_or_else(|| format!("thread {thread}"))
    }
}

/// Shared state a query may read
pub struct QueryContext<'a> {
    pub thread_names: &'a ThreadNames,
    pub parameter: Option<ParameterCallback>,
}

/// Worker-side query handler; owns the registry and the symbol resolver
pub struct QueryServer {
    registry: Registry,
    factory: Option<ResolverFactory>,
    resolver: Option<Box<dyn SymbolResolver>>,
    code_transfer: bool,
}

impl QueryServer {
    #[must_use]
    pub fn new(factory: ResolverFactory, code_transfer: bool) -> Self {
        Self { registry: Registry::new(), factory: Some(factory), resolver: None, code_transfer }
    }

    pub fn registry(&mut self) -> &mut Registry {
        &mut self.registry
    }

    fn resolver(&mut self) -> &mut dyn SymbolResolver {
        let factory = &mut self.factory;
        self.resolver
            .get_or_insert_with(|| match factory.take() {
                Some(build) => build(),
                None => Box::new(BacktraceResolver),
            })
            .as_mut()
    }

    /// Answer one query into `out`
    pub fn service(
        &mut self,
        query: ServerQuery,
        ctx: &QueryContext<'_>,
        encoder: &mut RecordEncoder,
        out: &mut Vec<u8>,
    ) -> QueryOutcome {
        let handle = query.handle;
        let Some(kind) = QueryKind::from_u8(query.kind) else {
            debug!("Unknown query kind {}, acknowledging", query.kind);
            encoder.query_noop(out);
            return QueryOutcome::Continue;
        };
        debug!("Query {kind:?} handle=0x{handle:x} extra={}", query.extra);

        match kind {
            QueryKind::Terminate => return QueryOutcome::Terminate,
            QueryKind::Disconnect => return QueryOutcome::Disconnect,
            QueryKind::String | QueryKind::PlotName | QueryKind::FrameName => {
                let tag = match kind {
                    QueryKind::PlotName => RecordType::PlotName,
                    QueryKind::FrameName => RecordType::FrameName,
                    _ => RecordType::StringData,
                };
                let text = self.registry.string(handle).unwrap_or(UNKNOWN_STRING);
                encoder.string_response(tag, handle, text, out);
            }
            QueryKind::ThreadString => {
                let name = u32::try_from(handle)
                    .map_or_else(|_| UNKNOWN_STRING.to_string(), |tid| ctx.thread_names.name_or_default(tid));
                encoder.string_response(RecordType::ThreadName, handle, &name, out);
            }
            QueryKind::SourceLocation => match self.registry.srcloc(handle) {
                Some(loc) => {
                    self.registry.register_srcloc(loc);
                    encoder.source_location(loc, out);
                }
                None => encoder.query_noop(out),
            },
            QueryKind::CallstackFrame => {
                let frames = self.resolver().resolve(handle);
                encoder.callstack_frame(handle, &frames, out);
            }
            QueryKind::SourceCode => self.source_code(handle, query.extra, encoder, out),
            QueryKind::Parameter => {
                if let (Some(callback), Ok(idx)) = (&ctx.parameter, u32::try_from(handle)) {
                    callback(idx, i32::from_le_bytes(query.extra.to_le_bytes()));
                }
            }
        }
        QueryOutcome::Continue
    }

    fn source_code(&self, handle: u64, id: u32, encoder: &mut RecordEncoder, out: &mut Vec<u8>) {
        let contents = self
            .registry
            .string(handle)
            .filter(|_| self.code_transfer)
            .filter(|path| std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() <= SOURCE_CODE_LIMIT))
            .and_then(|path| std::fs::read(path).ok());
        match contents {
            Some(data) => encoder.source_code(id, &data, out),
            None => encoder.source_code_not_available(id, out),
        }
    }
}
