//! Serial handling of bridge events.
//!
//! Every event is handled to completion before the next one is read, through
//! a fixed table keyed by [`EventKind`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeClient, BridgeEvent, ConnectionState, EventKind};
use crate::display::{
    clear_qr_display, print_connected, print_info, print_live_message, print_warning,
    render_qr_code, LiveMessage,
};
use crate::history::{self, LiveOutcome};
use crate::web::AppState;

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;
type Handler = for<'a> fn(&'a EventContext, BridgeEvent) -> HandlerFuture<'a>;

/// Everything a handler may touch for one bridge instance
pub struct EventContext {
    pub state: Arc<AppState>,
    pub client: BridgeClient,
    /// Ask for a history sync after the first login
    pub request_history: bool,
    history_requested: AtomicBool,
    /// Echo live messages to the terminal
    pub echo: bool,
}

impl EventContext {
    pub fn new(state: Arc<AppState>, client: BridgeClient, request_history: bool) -> Self {
        Self {
            state,
            client,
            request_history,
            history_requested: AtomicBool::new(false),
            echo: true,
        }
    }
}

pub struct EventRouter {
    handlers: HashMap<EventKind, Handler>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        let table: [(EventKind, Handler); 8] = [
            (EventKind::Qr, on_qr),
            (EventKind::Connected, on_connected),
            (EventKind::ConnectionChanged, on_connection_changed),
            (EventKind::MessageReceived, on_message),
            (EventKind::HistorySync, on_history_sync),
            (EventKind::LoggedOut, on_logged_out),
            (EventKind::Log, on_log),
            (EventKind::Error, on_error),
        ];
        Self {
            handlers: table.into_iter().collect(),
        }
    }

    /// Run the handler for `event`; kinds without one are logged and dropped
    pub async fn dispatch(&self, ctx: &EventContext, event: BridgeEvent) -> Result<()> {
        let kind = event.kind();
        match self.handlers.get(&kind) {
            Some(handler) => handler(ctx, event).await,
            None => {
                debug!("No handler for {:?} event", kind);
                Ok(())
            }
        }
    }
}

fn on_qr(_ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        if let BridgeEvent::Qr { data } = event {
            render_qr_code(&data)?;
        }
        Ok(())
    })
}

fn on_connected(ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        let BridgeEvent::Connected { phone, name, .. } = event else {
            return Ok(());
        };
        let _ = clear_qr_display();
        info!("Connected as {} ({})", name, phone);
        ctx.client.set_own_user(Some(phone.clone())).await;
        ctx.state
            .set_connected(true, Some(phone.clone()), Some(name.clone()))
            .await;
        print_connected(&phone, &name);

        if ctx.request_history && !ctx.history_requested.swap(true, Ordering::SeqCst) {
            print_info("Requesting history sync...");
            ctx.client.request_history_sync().await?;
        }
        Ok(())
    })
}

fn on_connection_changed(ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        let BridgeEvent::ConnectionState { state } = event else {
            return Ok(());
        };
        debug!("Connection state: {:?}", state);
        match state {
            ConnectionState::Disconnected | ConnectionState::LoggedOut => {
                ctx.state.set_connected(false, None, None).await;
            }
            ConnectionState::Reconnecting => print_warning("Connection lost, reconnecting..."),
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        Ok(())
    })
}

fn on_message(ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        let BridgeEvent::Message(msg) = event else {
            return Ok(());
        };
        let store = &ctx.state.store;
        let outcome = history::record_live_message(store, &ctx.client, &msg).await?;

        let LiveOutcome::Stored { chat_name } = outcome else {
            debug!("Skipping empty message {} in {}", msg.id, msg.chat_jid);
            return Ok(());
        };
        let sender = if msg.is_from_me {
            "Me".to_string()
        } else {
            match store.sender_name(&msg.sender) {
                Ok(name) => name,
                Err(e) => {
                    warn!("Failed to resolve sender {}: {}", msg.sender, e);
                    msg.push_name.clone().unwrap_or_else(|| msg.sender.clone())
                }
            }
        };
        let content = msg.content.text();
        let media = msg.content.media_info(msg.timestamp);
        let live = LiveMessage {
            timestamp: msg.timestamp,
            sender: &sender,
            chat_name: &chat_name,
            content: &content,
            is_from_me: msg.is_from_me,
            media: &media,
        };
        if ctx.echo {
            print_live_message(&live);
        } else {
            debug!("{}", live.line());
        }
        Ok(())
    })
}

fn on_history_sync(ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        let BridgeEvent::HistorySync(batch) = event else {
            return Ok(());
        };
        let stats = history::reconcile(&ctx.state.store, &ctx.client, &batch).await;
        info!(
            "History sync: {} messages stored across {} conversations ({} skipped)",
            stats.messages_stored,
            stats.conversations - stats.skipped_conversations,
            stats.skipped_conversations
        );
        Ok(())
    })
}

fn on_logged_out(ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        if let BridgeEvent::LoggedOut { reason } = event {
            warn!("Logged out: {}", reason);
            print_warning("Logged out of WhatsApp. Scan a new QR code to link again.");
        }
        ctx.client.set_own_user(None).await;
        ctx.state.set_connected(false, None, None).await;
        Ok(())
    })
}

fn on_log(_ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        if let BridgeEvent::Log { level, message } = event {
            match level.as_str() {
                "error" => error!("[bridge] {}", message),
                "warn" => warn!("[bridge] {}", message),
                "info" => info!("[bridge] {}", message),
                _ => debug!("[bridge] {}", message),
            }
        }
        Ok(())
    })
}

fn on_error(_ctx: &EventContext, event: BridgeEvent) -> HandlerFuture<'_> {
    Box::pin(async move {
        if let BridgeEvent::Error { code, message } = event {
            error!("Bridge error [{}]: {}", code, message);
        }
        Ok(())
    })
}
