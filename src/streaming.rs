use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GatewayError;
use crate::types::{
    normalize_finish_reason, ChatResponse, ResponseDelta, StreamItem, ToolCall, Usage, FINISH_STOP,
};

/// Delta channel capacity. Small and bounded so a slow consumer paces
/// the parser instead of an unbounded queue absorbing the stream.
pub const DELTA_CHANNEL_CAPACITY: usize = 16;

/// Create the bounded channel a streaming request delivers on
pub fn delta_channel() -> (mpsc::Sender<StreamItem>, mpsc::Receiver<StreamItem>) {
    mpsc::channel(DELTA_CHANNEL_CAPACITY)
}

/// Accumulates parsed vendor events into canonical deltas plus one
/// terminal response.
///
/// Deltas go out in wire order; the send blocks when the consumer lags
/// and aborts when the request is cancelled. Dropping the pump without
/// calling `finish`/`fail` closes the channel with no terminal event,
/// which is the cancellation contract.
pub struct DeltaPump {
    request_id: String,
    tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
    response_id: Option<String>,
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
    started: Instant,
}

impl DeltaPump {
    pub fn new(request_id: impl Into<String>, tx: mpsc::Sender<StreamItem>, cancel: CancellationToken) -> Self {
        Self {
            request_id: request_id.into(),
            tx,
            cancel,
            response_id: None,
            text: String::new(),
            tool_calls: Vec::new(),
            usage: None,
            finish_reason: None,
            metadata: HashMap::new(),
            started: Instant::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Accumulated visible text so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Deliver one incremental fragment.
    ///
    /// Returns false when the pump should stop: the request was cancelled
    /// or the consumer went away. Empty fragments are swallowed.
    pub async fn send_delta(&mut self, fragment: &str) -> bool {
        if fragment.is_empty() {
            return true;
        }
        self.text.push_str(fragment);
        let item = StreamItem::Delta(ResponseDelta {
            request_id: self.request_id.clone(),
            content: fragment.to_string(),
        });
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    pub fn set_response_id(&mut self, id: impl Into<String>) {
        self.response_id = Some(id.into());
    }

    pub fn push_tool_call(&mut self, call: ToolCall) {
        self.tool_calls.push(call);
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.usage = Some(usage);
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn set_finish_reason(&mut self, reason: impl Into<String>) {
        self.finish_reason = Some(reason.into());
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Emit the single terminal event with the reconciled final state.
    pub async fn finish(self) {
        let response = ChatResponse {
            id: self
                .response_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            request_id: self.request_id,
            content: self.text,
            tool_calls: self.tool_calls,
            usage: self.usage.unwrap_or_default(),
            finish_reason: normalize_finish_reason(
                self.finish_reason.as_deref().unwrap_or(FINISH_STOP),
            ),
            latency_ms: self.started.elapsed().as_millis() as u64,
            created: Utc::now(),
            metadata: self.metadata,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("stream cancelled before terminal event");
            }
            _ = self.tx.send(StreamItem::Done(Box::new(response))) => {}
        }
    }

    /// Close the stream with a terminal error carrying the last-known
    /// partial text and usage.
    pub async fn fail(self, error: GatewayError) {
        let item = StreamItem::Error {
            error,
            partial_text: self.text,
            usage: self.usage,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("stream cancelled before error event");
            }
            _ = self.tx.send(item) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deltas_concatenate_to_terminal_text() {
        let (tx, mut rx) = delta_channel();
        let cancel = CancellationToken::new();
        let mut pump = DeltaPump::new("req-1", tx, cancel);

        tokio::spawn(async move {
            assert!(pump.send_delta("Hello").await);
            assert!(pump.send_delta(" world").await);
            assert!(pump.send_delta("!").await);
            pump.set_usage(Usage::new(5, 10));
            pump.set_finish_reason("stop");
            pump.finish().await;
        });

        let mut fragments = String::new();
        let mut terminal = None;
        while let Some(item) = rx.recv().await {
            match item {
                StreamItem::Delta(delta) => {
                    assert_eq!(delta.request_id, "req-1");
                    fragments.push_str(&delta.content);
                }
                StreamItem::Done(response) => terminal = Some(response),
                StreamItem::Error { error, .. } => panic!("unexpected error: {}", error),
            }
        }

        let response = terminal.expect("terminal event");
        assert_eq!(fragments, "Hello world!");
        assert_eq!(response.content, "Hello world!");
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_deltas_carry_no_usage() {
        let (tx, mut rx) = delta_channel();
        let mut pump = DeltaPump::new("req-2", tx, CancellationToken::new());

        tokio::spawn(async move {
            pump.send_delta("chunk").await;
            pump.finish().await;
        });

        // First item is a bare fragment; usage only exists on Done
        match rx.recv().await.unwrap() {
            StreamItem::Delta(delta) => assert_eq!(delta.content, "chunk"),
            _ => panic!("expected delta first"),
        }
        match rx.recv().await.unwrap() {
            StreamItem::Done(response) => assert_eq!(response.usage, Usage::default()),
            _ => panic!("expected terminal event"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_closes_channel_without_terminal() {
        let (tx, mut rx) = delta_channel();
        let cancel = CancellationToken::new();
        let mut pump = DeltaPump::new("req-3", tx, cancel.clone());

        cancel.cancel();
        let handle = tokio::spawn(async move {
            // send_delta observes cancellation and reports stop
            let alive = pump.send_delta("late").await;
            assert!(!alive);
            // pump dropped here without finish(): channel closes
        });
        handle.await.unwrap();

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_carries_partial_text() {
        let (tx, mut rx) = delta_channel();
        let mut pump = DeltaPump::new("req-4", tx, CancellationToken::new());

        tokio::spawn(async move {
            pump.send_delta("partial ").await;
            pump.send_delta("answer").await;
            pump.fail(GatewayError::Transport("connection reset".into())).await;
        });

        let mut partial = None;
        while let Some(item) = rx.recv().await {
            if let StreamItem::Error { error, partial_text, .. } = item {
                assert!(error.is_retryable());
                partial = Some(partial_text);
            }
        }
        assert_eq!(partial.as_deref(), Some("partial answer"));
    }

    #[tokio::test]
    async fn test_bounded_channel_applies_backpressure() {
        let (tx, mut rx) = delta_channel();
        let mut pump = DeltaPump::new("req-5", tx, CancellationToken::new());

        let producer = tokio::spawn(async move {
            for i in 0..100 {
                if !pump.send_delta(&format!("{} ", i)).await {
                    return;
                }
            }
            pump.finish().await;
        });

        // Consume slowly; wire order must hold
        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            if let StreamItem::Delta(delta) = item {
                seen.push(delta.content.trim().parse::<usize>().unwrap());
            }
            tokio::task::yield_now().await;
        }
        producer.await.unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
