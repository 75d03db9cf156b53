//! Request correlation: narrow a channel's event broadcast down to the
//! children of one request.
//!
//! Every kernel response carries its request's `msg_id` in `parent_header`.
//! [`correlated_events`] subscribes to the channel and yields the transport
//! events relevant to one request: its child messages in arrival order, plus
//! channel-level failures (process exit, close) that any correlated consumer
//! must observe. [`children_of`] is the message-only view used where
//! failures end the wait naturally. Subscribe *before* sending the request
//! or early children can be missed.

use futures::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use suzuri_protocol::Message;

use crate::transport::{Channel, TransportEvent};

/// Transport events relevant to replies to `parent_msg_id`: child messages,
/// [`TransportEvent::Exited`], and [`TransportEvent::Closed`]. Unrelated
/// messages and diagnostics are skipped. Ends after yielding the close. A
/// lagged broadcast slot is logged and skipped; correlation resumes with the
/// next event.
pub fn correlated_events<T: Into<String>>(
    channel: &Channel,
    parent_msg_id: T,
) -> impl Stream<Item = TransportEvent> + Send + Unpin + use<T> {
    let parent = parent_msg_id.into();
    let rx = channel.subscribe();
    Box::pin(futures::stream::unfold(
        (rx, parent, false),
        |(mut rx, parent, done)| async move {
            if done {
                return None;
            }
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::Message(channel, msg)) if msg.is_child_of(&parent) => {
                        return Some((TransportEvent::Message(channel, msg), (rx, parent, false)));
                    }
                    Ok(event @ TransportEvent::Exited { .. }) => {
                        return Some((event, (rx, parent, false)));
                    }
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        return Some((TransportEvent::Closed, (rx, parent, true)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "correlator lagged behind transport events");
                        continue;
                    }
                }
            }
        },
    ))
}

/// Messages replying to `parent_msg_id`, in arrival order. Ends when the
/// channel closes.
pub fn children_of<T: Into<String>>(
    channel: &Channel,
    parent_msg_id: T,
) -> impl Stream<Item = Message> + Send + Unpin + use<T> {
    Box::pin(
        correlated_events(channel, parent_msg_id).filter_map(|event| {
            futures::future::ready(match event {
                TransportEvent::Message(_, msg) => Some(msg),
                _ => None,
            })
        }),
    )
}

// ============================================================================
// Tests
// ============================================================================
