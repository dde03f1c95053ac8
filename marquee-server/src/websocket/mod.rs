use crate::services::document_store::{Change, DocumentService};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

// Server → Node messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "snapshot")]
    Snapshot {
        sub_id: u64,
        document: Option<Value>,
    },
    #[serde(rename = "reply")]
    Reply {
        request_id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        document: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// Node → Server messages
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeMessage {
    #[serde(rename = "subscribe")]
    Subscribe {
        sub_id: u64,
        collection: String,
        doc_id: String,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { sub_id: u64 },
    #[serde(rename = "get")]
    Get {
        request_id: u64,
        collection: String,
        doc_id: String,
    },
    #[serde(rename = "update")]
    Update {
        request_id: u64,
        collection: String,
        doc_id: String,
        fields: Value,
    },
    #[serde(rename = "find_unpaired")]
    FindUnpaired { request_id: u64, pairing_code: String },
}

struct Watch {
    collection: String,
    doc_id: String,
    /// Revision of the last snapshot sent for this subscription.
    revision: u64,
}

/// Per-connection subscription state. Everything a node sees goes through
/// `out` in the order it was produced.
struct Connection {
    documents: DocumentService,
    out: UnboundedSender<ServerMessage>,
    watches: HashMap<u64, Watch>,
}

fn reply(request_id: u64, result: Result<Option<Value>, String>) -> ServerMessage {
    match result {
        Ok(document) => ServerMessage::Reply {
            request_id,
            ok: true,
            document,
            error: None,
        },
        Err(error) => ServerMessage::Reply {
            request_id,
            ok: false,
            document: None,
            error: Some(error),
        },
    }
}

impl Connection {
    fn new(documents: DocumentService, out: UnboundedSender<ServerMessage>) -> Self {
        Self {
            documents,
            out,
            watches: HashMap::new(),
        }
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.out.send(message);
    }

    fn on_text(&mut self, text: &str) {
        match serde_json::from_str::<NodeMessage>(text) {
            Ok(message) => self.handle(message),
            Err(e) => tracing::warn!("Ignoring unreadable node message: {}", e),
        }
    }

    fn handle(&mut self, message: NodeMessage) {
        match message {
            NodeMessage::Subscribe {
                sub_id,
                collection,
                doc_id,
            } => {
                let mut watch = Watch {
                    collection,
                    doc_id,
                    revision: 0,
                };
                self.refresh(sub_id, &mut watch);
                self.watches.insert(sub_id, watch);
            }
            NodeMessage::Unsubscribe { sub_id } => {
                self.watches.remove(&sub_id);
            }
            NodeMessage::Get {
                request_id,
                collection,
                doc_id,
            } => {
                let result = self
                    .documents
                    .get(&collection, &doc_id)
                    .map_err(|e| e.to_string());
                self.send(reply(request_id, result));
            }
            NodeMessage::Update {
                request_id,
                collection,
                doc_id,
                fields,
            } => {
                let result = self
                    .documents
                    .merge(&collection, &doc_id, fields)
                    .map(|_| None)
                    .map_err(|e| e.to_string());
                self.send(reply(request_id, result));
            }
            NodeMessage::FindUnpaired {
                request_id,
                pairing_code,
            } => {
                let result = self
                    .documents
                    .find_unpaired(&pairing_code)
                    .map(|found| found.map(|id| json!({ "id": id })))
                    .map_err(|e| e.to_string());
                self.send(reply(request_id, result));
            }
        }
    }

    /// Sends the current document for one subscription.
    fn refresh(&self, sub_id: u64, watch: &mut Watch) {
        match self.documents.snapshot(&watch.collection, &watch.doc_id) {
            Ok(snapshot) => {
                watch.revision = snapshot.revision;
                self.send(ServerMessage::Snapshot {
                    sub_id,
                    document: snapshot.document,
                });
            }
            Err(e) => tracing::error!(
                "Failed to read {}/{} for subscription {}: {}",
                watch.collection,
                watch.doc_id,
                sub_id,
                e
            ),
        }
    }

    fn on_change(&mut self, change: &Change) {
        for (sub_id, watch) in self.watches.iter_mut() {
            if watch.collection == change.collection
                && watch.doc_id == change.doc_id
                && watch.revision < change.revision
            {
                watch.revision = change.revision;
                let _ = self.out.send(ServerMessage::Snapshot {
                    sub_id: *sub_id,
                    document: change.document.clone(),
                });
            }
        }
    }

    /// Re-sends every subscription after the change feed dropped messages.
    fn resync(&mut self) {
        let mut watches = std::mem::take(&mut self.watches);
        for (sub_id, watch) in watches.iter_mut() {
            self.refresh(*sub_id, watch);
        }
        self.watches = watches;
    }
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = unbounded_channel::<ServerMessage>();

    // Spawn a task to forward messages from the channel to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Subscribe to the feed before any snapshot is read so no commit can
    // fall between the two.
    let mut changes = state.documents.subscribe_changes();
    let mut connection = Connection::new(state.documents.clone(), tx);

    let mut recv_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => connection.on_text(&text),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                change = changes.recv() => match change {
                    Ok(change) => connection.on_change(&change),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Connection fell {} changes behind, resending snapshots", missed);
                        connection.resync();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        connection.watches.len()
    });

    tracing::info!("Node connected");

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        watches = (&mut recv_task) => {
            send_task.abort();
            if let Ok(watches) = watches {
                tracing::debug!("Dropped {} subscriptions", watches);
            }
        }
    }

    tracing::info!("Node disconnected");
}
