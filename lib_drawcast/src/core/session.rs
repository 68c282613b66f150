//! # Subscriber Session
//!
//! Transport-independent side of one subscriber connection. The gateway
//! feeds every inbound text frame to [`SubscriberSession::handle_text`] and
//! writes back whatever it returns, then forwards queued update frames from
//! [`SubscriberSession::next_frame`]. Dropping the session disconnects the
//! subscriber from the fanout.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::dispatcher::{EventFanout, Frame};
use crate::core::model::{ClientMessage, ServerMessage};
use crate::core::registry::SubscriberId;
use crate::error::RegistryError;

/// One wire text frame.
pub type Outbound = Arc<str>;

/// A connected subscriber.
pub struct SubscriberSession {
    id: SubscriberId,
    fanout: Arc<EventFanout>,
    frames: mpsc::Receiver<Arc<Frame>>,
}

impl SubscriberSession {
    /// Registers a new subscriber with the fanout.
    pub fn open(fanout: Arc<EventFanout>) -> Result<Self, RegistryError> {
        let (id, frames) = fanout.connect()?;
        Ok(Self { id, fanout, frames })
    }

    /// Registry id of this subscriber.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Handles one client text frame and returns the replies in send order.
    ///
    /// A successful subscribe yields the `subscribed` acknowledgement
    /// followed by one snapshot `update` per newly added target that has a
    /// known result. Anything the server cannot act on yields exactly one
    /// `error` reply.
    pub async fn handle_text(&self, text: &str) -> Vec<Outbound> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(subscriber = self.id, code = e.code, "protocol error");
                return vec![reply(&ServerMessage::Error {
                    code: e.code,
                    message: e.message,
                })];
            }
        };

        match message {
            ClientMessage::Subscribe(targets) => {
                match self.fanout.subscribe(self.id, &targets).await {
                    Ok(subscription) => {
                        let mut out = Vec::with_capacity(1 + subscription.snapshot.len());
                        out.push(reply(&ServerMessage::Subscribed { targets }));
                        out.extend(subscription.snapshot.iter().map(|f| f.text.clone()));
                        out
                    }
                    Err(e) => vec![rejection(&e)],
                }
            }
            ClientMessage::Unsubscribe(targets) => match self.fanout.unsubscribe(self.id, &targets) {
                Ok(removed) => vec![reply(&ServerMessage::Unsubscribed { targets: removed })],
                Err(e) => vec![rejection(&e)],
            },
            ClientMessage::Ping => vec![reply(&ServerMessage::Pong)],
        }
    }

    /// Next queued update. `None` once the fanout dropped this subscriber.
    pub async fn next_frame(&mut self) -> Option<Arc<Frame>> {
        self.frames.recv().await
    }

    /// Queued update, if any, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Arc<Frame>> {
        self.frames.try_recv().ok()
    }

    /// Current interest set.
    pub fn interest(&self) -> Vec<String> {
        self.fanout
            .registry()
            .interest_of(self.id)
            .unwrap_or_default()
    }
}

impl Drop for SubscriberSession {
    fn drop(&mut self) {
        self.fanout.disconnect(self.id);
    }
}

fn reply(message: &ServerMessage<'_>) -> Outbound {
    Arc::from(message.to_text())
}

fn rejection(error: &RegistryError) -> Outbound {
    reply(&ServerMessage::Error {
        code: error.code(),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::DrawResult;
    use crate::core::registry::{SubscriberLimits, SubscriberRegistry};
    use crate::core::target::{Target, TargetRegistry, TimingClass};
    use serde_json::{json, Value};

    fn fanout() -> Arc<EventFanout> {
        let targets = Arc::new(TargetRegistry::new(vec![
            Target::new("fast-5", 75, TimingClass::ZeroWait),
            Target::new("sched-1", 0, TimingClass::Manual),
        ]));
        Arc::new(EventFanout::new(Arc::new(SubscriberRegistry::new(
            targets,
            SubscriberLimits::default(),
        ))))
    }

    fn parsed(text: &Outbound) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn subscribe_acks_then_snapshots() {
        let fanout = fanout();
        fanout.publish_local(&DrawResult::new("fast-5", "100", json!([1, 2])));
        let session = SubscriberSession::open(fanout.clone()).unwrap();

        let out = session
            .handle_text(r#"{"type":"subscribe","targets":["fast-5","sched-1"]}"#)
            .await;
        assert_eq!(out.len(), 2);
        assert_eq!(parsed(&out[0])["type"], "subscribed");
        assert_eq!(parsed(&out[1])["type"], "update");
        assert_eq!(parsed(&out[1])["sequence"], "100");
        assert_eq!(session.interest().len(), 2);
    }

    #[tokio::test]
    async fn errors_are_explicit() {
        let session = SubscriberSession::open(fanout()).unwrap();

        let out = session.handle_text(r#"{"type":"dance"}"#).await;
        assert_eq!(parsed(&out[0])["code"], "unknown_type");

        let out = session
            .handle_text(r#"{"type":"subscribe","targets":["nope"]}"#)
            .await;
        assert_eq!(parsed(&out[0])["type"], "error");
        assert_eq!(parsed(&out[0])["code"], "unknown_target");
        assert!(session.interest().is_empty());

        let out = session.handle_text(r#"{"type":"ping"}"#).await;
        assert_eq!(parsed(&out[0])["type"], "pong");
    }

    #[tokio::test]
    async fn updates_flow_and_drop_disconnects() {
        let fanout = fanout();
        let mut session = SubscriberSession::open(fanout.clone()).unwrap();
        session
            .handle_text(r#"{"type":"subscribe","targets":["fast-5"]}"#)
            .await;

        fanout.publish_local(&DrawResult::new("fast-5", "101", json!(null)));
        let frame = session.next_frame().await.unwrap();
        assert_eq!(frame.sequence, "101");

        let out = session
            .handle_text(r#"{"type":"unsubscribe","targets":["fast-5","sched-1"]}"#)
            .await;
        assert_eq!(parsed(&out[0])["targets"], json!(["fast-5"]));

        assert_eq!(fanout.registry().subscriber_count(), 1);
        drop(session);
        assert_eq!(fanout.registry().subscriber_count(), 0);
    }
}
