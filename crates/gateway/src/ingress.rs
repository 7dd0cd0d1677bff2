//! Ingress Multiplexer (§2, component H): merges the message streams of
//! every configured backend into one ordered, in-process queue that the
//! orchestrator drains.
//!
//! Reading a backend's own wire protocol (iMessage's chat.db, Signal's
//! signal-cli socket, the test harness, the voice app's HTTP callback) is
//! out of scope here — each backend is injected as a [`MessageSource`] that
//! already yields canonical [`Message`]s. Deduplication is the backends'
//! responsibility (§6 "Ingress contract"); this module only merges and
//! routes.

use std::sync::Arc;

use futures_util::stream::{BoxStream, SelectAll, StreamExt};

use sa_domain::message::Message;

use crate::orchestrator::Orchestrator;

/// One inbound item from a backend: a direct message, or a group message
/// paired with the participant list the orchestrator needs for group
/// admission (§4.4 "Group admission") — a backend concern, since only the
/// backend knows a group chat's membership.
pub enum IngressEvent {
    Direct(Message),
    Group { message: Message, participants: Vec<String> },
}

/// A backend's message feed. Implementors hand over ownership of
/// themselves to produce a stream, since most real backends (a polling
/// chat.db reader, a signal-cli subprocess) are consumed by their own
/// background task once started.
pub trait MessageSource: Send {
    fn into_stream(self: Box<Self>) -> BoxStream<'static, IngressEvent>;
}

/// Merges every registered [`MessageSource`] into a single stream and
/// drains it by calling into the orchestrator. Built once at startup from
/// the full set of enabled backends; `run` consumes it for the life of the
/// process.
pub struct IngressMultiplexer {
    orchestrator: Arc<Orchestrator>,
    sources: Vec<Box<dyn MessageSource>>,
}

impl IngressMultiplexer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            sources: Vec::new(),
        }
    }

    pub fn add_source(&mut self, source: Box<dyn MessageSource>) {
        self.sources.push(source);
    }

    /// Spawn the merge-and-drain loop as a detached task. A single bad
    /// message (one that fails `inject_message`/`inject_group_message`) is
    /// logged and skipped — it never kills the merged stream, since that
    /// would silently stop ingress for every other backend too.
    pub fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(self) {
        let mut merged: SelectAll<BoxStream<'static, IngressEvent>> = SelectAll::new();
        for source in self.sources {
            merged.push(source.into_stream());
        }

        while let Some(event) = merged.next().await {
            let result = match event {
                IngressEvent::Direct(message) => self.orchestrator.inject_message(&message).await,
                IngressEvent::Group { message, participants } => {
                    self.orchestrator.inject_group_message(&message, &participants).await
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "ingress: message injection failed");
            }
        }
    }
}
