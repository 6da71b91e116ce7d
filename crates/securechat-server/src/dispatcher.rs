//! Message dispatch
//!
//! Routes one decoded client message to the engine on behalf of the handler
//! that received it.

use securechat_core::ChatMessage;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::handler::ConnectionHandler;

/// Whether the handler's message loop keeps reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Act on one message from the client served by `handler`.
///
/// Failures that concern only this message are logged and skipped.
pub async fn dispatch(handler: &ConnectionHandler, engine: &Engine, message: ChatMessage) -> Flow {
    let Some(client) = handler.client() else {
        return Flow::Stop;
    };
    // A later login under the same identifier supersedes this session
    let entry = match engine.registry().get(&client) {
        Some(entry) if &entry.handler == handler.id() => entry,
        _ => {
            warn!(handler = %handler.id(), %client, "Session superseded or missing; closing");
            handler.close_session(engine).await;
            return Flow::Stop;
        }
    };

    match message {
        ChatMessage::Message(ciphertext) => {
            match engine.credentials().decrypt_symmetric(&ciphertext, &entry.session_key) {
                Ok(text) => {
                    let line = format!("{}: {}", client, text);
                    engine.events().append_chat(&line);
                    engine.broadcast(&line).await;
                }
                Err(e) => warn!(handler = %handler.id(), %client, error = %e, "Undecryptable chat message"),
            }
            Flow::Continue
        }
        ChatMessage::Logout => {
            info!(handler = %handler.id(), %client, "Client logged out");
            handler.close_session(engine).await;
            Flow::Stop
        }
        ChatMessage::WhoIsIn => {
            let listing = engine.who_is_in();
            engine
                .events()
                .append_event(&format!("[{}] {} asked who is in", handler.id(), client));
            for entry in &listing {
                engine.events().append_event(&entry.to_string());
                handler.write_msg(engine, &entry.to_string()).await;
            }
            Flow::Continue
        }
        ChatMessage::PrivateMessage { target, ciphertext } => {
            match engine.credentials().decrypt_symmetric(&ciphertext, &entry.session_key) {
                Ok(text) => {
                    debug!(handler = %handler.id(), from = %client, to = %target, "Private message");
                    engine.unicast(&target, &text).await;
                }
                Err(e) => warn!(handler = %handler.id(), %client, error = %e, "Undecryptable private message"),
            }
            Flow::Continue
        }
        ChatMessage::Unknown(tag) => {
            debug!(handler = %handler.id(), %client, tag, "Ignoring unknown message type");
            Flow::Continue
        }
    }
}
