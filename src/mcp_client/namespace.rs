//! Tool name namespacing.
//!
//! Several backends may expose tools with the same name, so tools are
//! presented to a model as `<backend>___<tool>`, folded to
//! `[A-Za-z0-9_]` and capped at 64 characters. The table remembers every id
//! it hands out so a model's tool call can be routed back to its backend.
//!
//! Entries are never pruned. Two different pairs that fold to the same id
//! resolve to whichever was registered last.

use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};

/// Separator between backend id and raw tool name.
pub const NAMESPACE_DELIMITER: &str = "___";

/// Longest external id accepted by model tool-call grammars.
pub const MAX_EXTERNAL_ID_LEN: usize = 64;

/// Hex characters of the digest kept when an id has to be shortened.
const DIGEST_SUFFIX_LEN: usize = 16;

/// The (backend, tool) pair an external id stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolRef {
    pub backend_id: String,
    pub tool_name: String,
}

/// Process-wide bidirectional map between external ids and tool refs.
#[derive(Debug, Default)]
pub struct ToolNamespace {
    entries: RwLock<HashMap<String, ToolRef>>,
}

impl ToolNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// External id for `raw_name` on `backend_id`, recording it for
    /// [`resolve`](Self::resolve).
    pub fn external_id(&self, backend_id: &str, raw_name: &str) -> String {
        let id = flatten_tool_id(backend_id, raw_name);
        let tool_ref = ToolRef {
            backend_id: backend_id.to_string(),
            tool_name: raw_name.to_string(),
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(&id) {
            Some(existing) if *existing == tool_ref => {}
            Some(existing) => {
                tracing::warn!(
                    external_id = %id,
                    previous_backend = %existing.backend_id,
                    previous_tool = %existing.tool_name,
                    backend = backend_id,
                    tool = raw_name,
                    "external tool id collision, latest registration wins"
                );
                entries.insert(id.clone(), tool_ref);
            }
            None => {
                entries.insert(id.clone(), tool_ref);
            }
        }
        id
    }

    /// Inverse of [`external_id`](Self::external_id).
    pub fn resolve(&self, external_id: &str) -> Option<ToolRef> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(external_id)
            .cloned()
    }

    /// Number of distinct external ids recorded.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deterministic external id for a (backend, tool) pair.
pub fn flatten_tool_id(backend_id: &str, raw_name: &str) -> String {
    let raw = format!("{backend_id}{NAMESPACE_DELIMITER}{raw_name}");
    let folded: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    if folded.len() <= MAX_EXTERNAL_ID_LEN {
        return folded;
    }

    let digest = format!("{:x}", Sha256::digest(raw.as_bytes()));
    let keep = MAX_EXTERNAL_ID_LEN - DIGEST_SUFFIX_LEN;
    format!("{}{}", &folded[..keep], &digest[..DIGEST_SUFFIX_LEN])
}
