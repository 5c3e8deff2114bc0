//! The tool catalog.
//!
//! A read-mostly union of every ready MCP server's tools plus the fixed
//! file built-ins, keyed by canonical name. Publication is an atomic
//! snapshot swap: a request grabs one [`CatalogSnapshot`] at admission and
//! never sees a partial update.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use switchboard_protocol::ToolSpec;

/// Server id used for the file built-ins.
pub const FS_SERVER: &str = "fs";

/// One tool as the agent loop sees it.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    /// Globally unique `mcp__{server}__{tool}` or `fs__{op}` name.
    pub canonical_name: String,
    /// Owning server (`fs` for built-ins).
    pub server: String,
    /// Tool name local to that server.
    pub local_name: String,
    /// Description shown to the model.
    pub description: Option<String>,
    /// Argument schema, passed through opaquely.
    pub arg_schema: Value,
    /// Category tag driving selection heuristics.
    pub category: Option<String>,
    /// Core tools bypass selection and are always exposed.
    pub core: bool,
}

/// Build the canonical name for an MCP tool.
pub fn canonical_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// Where a canonical name routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRoute {
    /// An MCP server tool.
    Mcp {
        /// Server id.
        server: String,
        /// Local tool name.
        tool: String,
    },
    /// A file built-in.
    Fs {
        /// Operation name.
        op: String,
    },
}

/// Split a canonical name back into its route.
pub fn split_canonical(name: &str) -> Option<ToolRoute> {
    if let Some(rest) = name.strip_prefix("mcp__") {
        let (server, tool) = rest.split_once("__")?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        return Some(ToolRoute::Mcp { server: server.to_owned(), tool: tool.to_owned() });
    }
    if let Some(op) = name.strip_prefix("fs__") {
        if op.is_empty() {
            return None;
        }
        return Some(ToolRoute::Fs { op: op.to_owned() });
    }
    None
}

/// One immutable published catalog.
#[derive(Debug)]
pub struct CatalogSnapshot {
    /// Publish counter; selection caches key on it.
    pub version: u64,
    tools: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
}

impl CatalogSnapshot {
    fn new(version: u64, tools: Vec<ToolDescriptor>) -> Self {
        let by_name = tools
            .iter()
            .enumerate()
            .map(|(index, tool)| (tool.canonical_name.clone(), index))
            .collect();
        Self { version, tools, by_name }
    }

    /// All descriptors, sorted by canonical name.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Look up one descriptor.
    pub fn get(&self, canonical_name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(canonical_name).map(|&index| &self.tools[index])
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Distinct server ids present.
    pub fn servers(&self) -> BTreeSet<String> {
        self.tools.iter().map(|tool| tool.server.clone()).collect()
    }

    /// Descriptors owned by `server`.
    pub fn tools_for<'a>(&'a self, server: &'a str) -> impl Iterator<Item = &'a ToolDescriptor> {
        self.tools.iter().filter(move |tool| tool.server == server)
    }
}

/// The swap cell holding the current catalog.
pub struct ToolCatalog {
    current: ArcSwap<CatalogSnapshot>,
    publishes: AtomicU64,
}

impl ToolCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(CatalogSnapshot::new(0, Vec::new())),
            publishes: AtomicU64::new(0),
        }
    }

    /// Current snapshot handle. Capture once per request.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    /// Publish a new catalog from the given descriptors.
    ///
    /// Names must be globally unique; a duplicate is dropped with a
    /// warning rather than shadowing the first occurrence.
    pub fn publish(&self, descriptors: Vec<ToolDescriptor>) -> u64 {
        let mut seen = BTreeSet::new();
        let mut tools: Vec<ToolDescriptor> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if seen.insert(descriptor.canonical_name.clone()) {
                tools.push(descriptor);
            } else {
                warn!(name = %descriptor.canonical_name, "duplicate canonical tool name dropped");
            }
        }
        tools.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));

        let version = self.publishes.fetch_add(1, Ordering::Relaxed) + 1;
        self.current.store(Arc::new(CatalogSnapshot::new(version, tools)));
        version
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.current.load();
        f.debug_struct("ToolCatalog")
            .field("version", &snapshot.version)
            .field("tools", &snapshot.len())
            .finish()
    }
}

/// Convert one server's advertised tools into catalog descriptors.
pub fn descriptors_from_specs(
    server: &str,
    category: Option<&str>,
    core: bool,
    specs: &[ToolSpec],
) -> Vec<ToolDescriptor> {
    specs
        .iter()
        .map(|spec| ToolDescriptor {
            canonical_name: canonical_name(server, &spec.name),
            server: server.to_owned(),
            local_name: spec.name.clone(),
            description: spec.description.clone(),
            arg_schema: spec.input_schema.clone(),
            category: category.map(str::to_owned),
            core,
        })
        .collect()
}
