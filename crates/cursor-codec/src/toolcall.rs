//! Tool-call reassembly
//!
//! Tool calls arrive as argument fragments keyed by a stable call id. The
//! assembler tracks one entry per id, assigns the next OpenAI `index` when
//! an id first appears, and appends fragments in arrival order. `is_last`
//! finalises an entry; `finish()` finalises whatever remains because some
//! sources never send the terminal marker.

use std::collections::HashMap;

/// Incremental delta for streaming: what the current fragment added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: String,
    /// Set only on the first fragment for this id
    pub name: Option<String>,
    /// The newly received argument fragment (may be empty)
    pub arguments_fragment: String,
}

/// A fully reassembled tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug)]
struct Pending {
    index: usize,
    name: Option<String>,
    arguments: String,
    finished: bool,
}

/// Map from call id to accumulated state.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    entries: HashMap<String, Pending>,
    order: Vec<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record one fragment and return the streaming delta it produced.
    pub fn observe(
        &mut self,
        id: &str,
        name: Option<&str>,
        arguments_fragment: &str,
        is_last: bool,
    ) -> ToolCallDelta {
        let next_index = self.entries.len();
        let had_name = self.entries.get(id).is_some_and(|e| e.name.is_some());
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| {
            self.order.push(id.to_string());
            Pending {
                index: next_index,
                name: None,
                arguments: String::new(),
                finished: false,
            }
        });

        if entry.name.is_none()
            && let Some(name) = name
        {
            entry.name = Some(name.to_string());
        }
        // Fragments after the terminal marker are dropped
        if !entry.finished {
            entry.arguments.push_str(arguments_fragment);
        }
        if is_last {
            entry.finished = true;
        }

        ToolCallDelta {
            index: entry.index,
            id: id.to_string(),
            // Surface the name exactly once, on the fragment that supplied it
            name: if had_name { None } else { entry.name.clone() },
            arguments_fragment: arguments_fragment.to_string(),
        }
    }

    /// Finalise every entry, including those whose `is_last` never arrived.
    pub fn finish(self) -> Vec<CompletedToolCall> {
        let mut entries = self.entries;
        self.order
            .iter()
            .filter_map(|id| {
                entries.remove(id).map(|pending| CompletedToolCall {
                    index: pending.index,
                    id: id.clone(),
                    name: pending.name.unwrap_or_default(),
                    arguments: pending.arguments,
                })
            })
            .collect()
    }
}
