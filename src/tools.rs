use serde::Serialize;
use std::collections::BTreeMap;

/// Provider-side tools billed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltInTool {
    WebSearchPreview,
    FileSearch,
}

impl BuiltInTool {
    /// Resolves a tool declaration `type`, e.g. from a request's `tools` array.
    pub fn from_tool_type(tool_type: &str) -> Option<Self> {
        match tool_type {
            "web_search_preview" | "web_search" => Some(Self::WebSearchPreview),
            "file_search" => Some(Self::FileSearch),
            _ => None,
        }
    }

    /// Resolves an output item `type`, e.g. `web_search_call`.
    pub fn from_item_type(item_type: &str) -> Option<Self> {
        match item_type {
            "web_search_call" => Some(Self::WebSearchPreview),
            "file_search_call" => Some(Self::FileSearch),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSearchPreview => "web_search_preview",
            Self::FileSearch => "file_search",
        }
    }
}

/// Per-request call counters. Counts only go up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ToolStat {
    counts: BTreeMap<BuiltInTool, u64>,
}

impl ToolStat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool with a zero count if it is not tracked yet.
    pub fn declare(&mut self, tool: BuiltInTool) {
        self.counts.entry(tool).or_insert(0);
    }

    pub fn record(&mut self, tool: BuiltInTool) {
        let count = self.counts.entry(tool).or_insert(0);
        *count = count.saturating_add(1);
        metrics::counter!("relay_tool_calls_total", "tool" => tool.as_str()).increment(1);
    }

    /// Records a call by raw tool type. Unknown types are dropped and `false` is returned.
    pub fn record_tool_type(&mut self, tool_type: &str) -> bool {
        match BuiltInTool::from_tool_type(tool_type) {
            Some(tool) => {
                self.record(tool);
                true
            }
            None => {
                tracing::debug!(tool_type, "ignoring unrecognized tool type");
                false
            }
        }
    }

    pub fn get(&self, tool: BuiltInTool) -> u64 {
        self.counts.get(&tool).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BuiltInTool, u64)> + '_ {
        self.counts.iter().map(|(tool, count)| (*tool, *count))
    }
}
