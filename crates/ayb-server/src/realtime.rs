//! Realtime hub: single-process SSE fan-out with per-event RLS checks.
//!
//! The subscriber registry sits behind a mutex; broadcasts clone the
//! senders out of the lock and push into each subscriber's bounded channel
//! with `try_send`. A full channel means a slow consumer — the subscriber
//! is dropped and its stream closes. Visibility is checked per event, in
//! the subscriber's writer task, so permission changes take effect on the
//! very next event.

use std::{collections::HashMap, convert::Infallible};

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use ayb_db::SessionClaims;
use futures::{stream, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    auth::{bearer_from_headers, resolve_bearer, AuthContext},
    error::ApiError,
    events::ChangeEvent,
    state::SharedState,
};

/// Bounded per-subscriber backlog; overflow drops the subscriber.
const SUBSCRIBER_BUFFER: usize = 256;
const HEARTBEAT_SECONDS: u64 = 30;

#[derive(Debug)]
pub enum HubMessage {
    Change(ChangeEvent),
    /// Tokens routed back from an OAuth provider callback.
    OAuthResult(Value),
}

struct Subscriber {
    tables: Vec<String>,
    claims: SessionClaims,
    oauth: bool,
    tx: mpsc::Sender<HubMessage>,
}

#[derive(Default)]
pub struct RealtimeHub {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        tables: Vec<String>,
        claims: SessionClaims,
        oauth: bool,
    ) -> (Uuid, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let client_id = Uuid::new_v4();
        self.subscribers.lock().insert(
            client_id,
            Subscriber {
                tables,
                claims,
                oauth,
                tx,
            },
        );
        info!(%client_id, "realtime subscriber connected");
        (client_id, rx)
    }

    pub fn unsubscribe(&self, client_id: Uuid) {
        if self.subscribers.lock().remove(&client_id).is_some() {
            debug!(%client_id, "realtime subscriber disconnected");
        }
    }

    pub fn subscriber_claims(&self, client_id: Uuid) -> Option<SessionClaims> {
        self.subscribers
            .lock()
            .get(&client_id)
            .map(|sub| sub.claims.clone())
    }

    /// Fan-out. Senders are cloned out of the registry so no await (and no
    /// channel push) happens under the lock.
    pub fn publish(&self, event: ChangeEvent) -> Result<(), ApiError> {
        let targets: Vec<(Uuid, mpsc::Sender<HubMessage>)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|(_, sub)| sub.tables.iter().any(|t| t == &event.table))
                .map(|(id, sub)| (*id, sub.tx.clone()))
                .collect()
        };

        let mut dropped = Vec::new();
        for (client_id, tx) in targets {
            if tx.try_send(HubMessage::Change(event.clone())).is_err() {
                dropped.push(client_id);
            }
        }
        for client_id in dropped {
            info!(%client_id, "dropping slow realtime subscriber");
            self.unsubscribe(client_id);
        }
        Ok(())
    }

    /// Routes an OAuth result to the subscriber that initiated the flow.
    /// Returns `false` when the client is gone.
    pub fn deliver_oauth_result(&self, client_id: Uuid, payload: Value) -> bool {
        let tx = {
            let subscribers = self.subscribers.lock();
            subscribers
                .get(&client_id)
                .filter(|sub| sub.oauth)
                .map(|sub| sub.tx.clone())
        };
        match tx {
            Some(tx) => tx.try_send(HubMessage::OAuthResult(payload)).is_ok(),
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    #[serde(default)]
    tables: Option<String>,
    /// SSE cannot set headers from `EventSource`; the bearer may ride in
    /// the query string on this endpoint only.
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    oauth: Option<bool>,
}

/// `GET /api/realtime?tables=a,b[&token=…][&oauth=true]`
pub async fn realtime_handler(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Query(query): Query<RealtimeQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let context = match bearer_from_headers(&headers)? {
        Some(token) => resolve_bearer(&state, &token).await?,
        None => match query.token.as_deref() {
            Some(token) => resolve_bearer(&state, token).await?,
            None => AuthContext::anonymous(),
        },
    };

    let oauth = query.oauth.unwrap_or(false);
    let tables: Vec<String> = query
        .tables
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect();
    if tables.is_empty() && !oauth {
        return Err(ApiError::bad_request("tables query parameter is required"));
    }
    let snapshot = state.schema.snapshot();
    for table in &tables {
        if snapshot.resolve(table).is_none() {
            return Err(ApiError::not_found(format!("unknown table \"{table}\"")));
        }
    }

    let claims = context.session_claims();
    let (client_id, rx) = state.hub.subscribe(tables, claims.clone(), oauth);

    let connected = stream::once(async move {
        Ok(Event::default()
            .event("connected")
            .data(json!({ "clientId": client_id }).to_string()))
    });

    let stream_state = state.clone();
    let events = ReceiverStream::new(rx)
        .then(move |message| {
            let state = stream_state.clone();
            let claims = claims.clone();
            async move { render_message(&state, &claims, message).await }
        })
        .filter_map(|maybe| async move { maybe.map(Ok) });

    let guard = DisconnectGuard {
        state: state.clone(),
        client_id,
    };
    let stream = connected
        .chain(events)
        .chain(stream::once(async move {
            drop(guard);
            Ok(Event::default().comment(""))
        }));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(HEARTBEAT_SECONDS))
            .text(""),
    ))
}

/// Per-event visibility: create/update events must survive a probe under
/// the subscriber's claims; delete events pass through with their PK-only
/// payload.
async fn render_message(
    state: &SharedState,
    claims: &SessionClaims,
    message: HubMessage,
) -> Option<Event> {
    match message {
        HubMessage::OAuthResult(payload) => Some(
            Event::default()
                .event("oauth_complete")
                .data(payload.to_string()),
        ),
        HubMessage::Change(event) => {
            if event.action != "delete" {
                let snapshot = state.schema.snapshot();
                let table = snapshot.resolve(&event.table)?;
                let pk = event.pk_text(table)?;
                match state.gateway.visible(claims, table, &pk).await {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(err) => {
                        tracing::warn!(error = %err, "visibility probe failed; withholding event");
                        return None;
                    }
                }
            }
            Some(Event::default().data(
                json!({
                    "action": event.action,
                    "table": event.table,
                    "record": event.record,
                })
                .to_string(),
            ))
        }
    }
}

/// Removes the subscriber from the registry when the SSE stream is torn
/// down.
struct DisconnectGuard {
    state: SharedState,
    client_id: Uuid,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.state.hub.unsubscribe(self.client_id);
    }
}
