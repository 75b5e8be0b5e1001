use crate::error::UpstreamErrorBody;
use crate::relay::stream::{DoneItem, StreamEvent};
use crate::tools::{BuiltInTool, ToolStat};
use crate::usage::{TokenEstimator, Usage, UsageSource};
use serde_json::Value;

/// Accounting state for exactly one in-flight request.
///
/// The caller creates it, lends it to the relay for the duration of one upstream
/// response and reads the results afterwards. Nothing in here is shared.
#[derive(Debug, Default)]
pub struct RequestUsageContext {
    model: String,
    tools: ToolStat,
    text: String,
    usage: Usage,
    terminal_usage_seen: bool,
    client_disconnected: bool,
    upstream_interrupted: bool,
    upstream_failure: Option<UpstreamErrorBody>,
}

impl RequestUsageContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Pre-registers the built-in tools named in a request `tools` array so the
    /// snapshot lists them even when they are never called.
    pub fn declare_tools(&mut self, tools: &Value) {
        let Some(arr) = tools.as_array() else {
            return;
        };
        for tool in arr {
            let Some(tool) = tool
                .get("type")
                .and_then(|v| v.as_str())
                .and_then(BuiltInTool::from_tool_type)
            else {
                continue;
            };
            self.tools.declare(tool);
        }
    }

    /// Folds one decoded stream event into the running state.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Completed { usage: Some(usage) } => {
                self.usage = *usage;
                self.terminal_usage_seen = true;
            }
            StreamEvent::Completed { usage: None } => {}
            StreamEvent::TextDelta { delta } => self.text.push_str(delta),
            StreamEvent::ItemDone {
                item: DoneItem::BuiltInToolCall(tool),
            } => self.tools.record(*tool),
            StreamEvent::ItemDone { .. } => {}
            StreamEvent::Failed { error } => {
                tracing::warn!(
                    model = %self.model,
                    message = %error.message,
                    "upstream reported a failure mid-stream"
                );
                self.upstream_failure = Some(error.clone());
            }
            StreamEvent::Other { .. } => {}
        }
    }

    pub(crate) fn set_reported_usage(&mut self, usage: Usage) {
        self.usage = usage;
        self.terminal_usage_seen = true;
    }

    pub(crate) fn record_tool_type(&mut self, tool_type: &str) {
        self.tools.record_tool_type(tool_type);
    }

    pub(crate) fn mark_client_disconnected(&mut self) {
        self.client_disconnected = true;
    }

    pub(crate) fn mark_upstream_interrupted(&mut self) {
        self.upstream_interrupted = true;
    }

    /// Settles the final usage once the stream has ended.
    ///
    /// Terminal usage from the provider always stands. Without it, a non-empty text
    /// buffer is run through `estimator` and the result is flagged as estimated.
    pub fn reconcile(&mut self, estimator: &dyn TokenEstimator) -> Usage {
        if !self.terminal_usage_seen && self.usage.completion_tokens == 0 && !self.text.is_empty()
        {
            self.usage.completion_tokens = estimator.estimate(&self.text, &self.model);
            self.usage.source = UsageSource::Estimated;
            metrics::counter!("relay_usage_estimated_total").increment(1);
            tracing::debug!(
                model = %self.model,
                completion_tokens = self.usage.completion_tokens,
                "no terminal usage from upstream, estimated completion tokens"
            );
        }
        self.usage
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn tool_stat(&self) -> &ToolStat {
        &self.tools
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn terminal_usage_seen(&self) -> bool {
        self.terminal_usage_seen
    }

    /// True when forwarding failed because the client went away. Usage is partial.
    pub fn client_disconnected(&self) -> bool {
        self.client_disconnected
    }

    /// True when the upstream byte stream broke before it ended cleanly.
    pub fn upstream_interrupted(&self) -> bool {
        self.upstream_interrupted
    }

    pub fn upstream_failure(&self) -> Option<&UpstreamErrorBody> {
        self.upstream_failure.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn word_count(text: &str, _model: &str) -> u64 {
        text.split_whitespace().count() as u64
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            delta: text.to_string(),
        }
    }

    #[test]
    fn terminal_usage_wins_even_with_zero_completion() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        ctx.apply(&delta("Hi"));
        ctx.apply(&delta(" there"));
        ctx.apply(&StreamEvent::Completed {
            usage: Some(Usage::reported(5, 0, 5)),
        });
        assert_eq!(ctx.reconcile(&word_count), Usage::reported(5, 0, 5));
    }

    #[test]
    fn later_terminal_usage_overwrites_earlier() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        ctx.apply(&StreamEvent::Completed {
            usage: Some(Usage::reported(1, 2, 3)),
        });
        ctx.apply(&StreamEvent::Completed {
            usage: Some(Usage::reported(7, 8, 15)),
        });
        assert_eq!(ctx.usage(), Usage::reported(7, 8, 15));
    }

    #[test]
    fn missing_terminal_usage_estimates_from_text() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        ctx.apply(&delta("one two"));
        ctx.apply(&delta(" three"));
        let usage = ctx.reconcile(&word_count);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.total_tokens, 0);
        assert!(usage.is_estimated());
    }

    #[test]
    fn reconcile_is_deterministic() {
        let mut first = RequestUsageContext::new("gpt-4o");
        let mut second = RequestUsageContext::new("gpt-4o");
        for ctx in [&mut first, &mut second] {
            ctx.apply(&delta("the same words every time"));
        }
        assert_eq!(first.reconcile(&word_count), second.reconcile(&word_count));
        assert_eq!(first.reconcile(&word_count), first.usage());
    }

    #[test]
    fn empty_text_leaves_usage_at_zero() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        let usage = ctx.reconcile(&word_count);
        assert_eq!(usage, Usage::default());
        assert!(!usage.is_estimated());
    }

    #[test]
    fn only_built_in_tool_items_are_counted() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        ctx.apply(&StreamEvent::ItemDone {
            item: DoneItem::BuiltInToolCall(BuiltInTool::WebSearchPreview),
        });
        ctx.apply(&StreamEvent::ItemDone {
            item: DoneItem::Unrecognized("message".to_string()),
        });
        ctx.apply(&StreamEvent::ItemDone {
            item: DoneItem::Missing,
        });
        assert_eq!(ctx.tool_stat().get(BuiltInTool::WebSearchPreview), 1);
        assert_eq!(ctx.tool_stat().iter().count(), 1);
    }

    #[test]
    fn declared_tools_start_at_zero() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        ctx.declare_tools(&json!([
            { "type": "web_search_preview" },
            { "type": "function", "name": "lookup" }
        ]));
        assert_eq!(
            ctx.tool_stat().iter().collect::<Vec<_>>(),
            vec![(BuiltInTool::WebSearchPreview, 0)]
        );
    }

    #[test]
    fn failure_is_recorded_without_touching_usage() {
        let mut ctx = RequestUsageContext::new("gpt-4o");
        ctx.apply(&delta("partial"));
        ctx.apply(&StreamEvent::Failed {
            error: UpstreamErrorBody {
                message: "server_error".to_string(),
                ..UpstreamErrorBody::default()
            },
        });
        assert_eq!(
            ctx.upstream_failure().map(|e| e.message.as_str()),
            Some("server_error")
        );
        assert_eq!(ctx.reconcile(&word_count).completion_tokens, 1);
    }
}
