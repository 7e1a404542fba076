use askpipe_core::{EventSink, StageEvent};
use tokio::sync::mpsc::UnboundedSender;

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &StageEvent) {}
}

/// Logs each event at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &StageEvent) {
        tracing::info!(
            conversation_id = %event.conversation_id,
            stage = event.kind.as_str(),
            payload = %event.payload,
            "stage"
        );
    }
}

/// Forwards events to a channel. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<StageEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<StageEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &StageEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Sends each event to every inner sink, in order.
pub struct FanoutSink(pub Vec<Box<dyn EventSink>>);

impl EventSink for FanoutSink {
    fn emit(&self, event: &StageEvent) {
        for s in &self.0 {
            s.emit(event);
        }
    }
}
