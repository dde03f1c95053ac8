use anyhow::Result;
use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

use super::{DocumentStore, StoreError, Subscription, SubscriptionHandle};

// Server → Node messages
#[derive(Debug, Serialize, Deserialize)]
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
        #[serde(default)]
        document: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

// Node → Server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

#[derive(Debug)]
struct Reply {
    ok: bool,
    document: Option<Value>,
    error: Option<String>,
}

enum Command {
    Subscribe {
        sub_id: u64,
        collection: String,
        doc_id: String,
        sink: mpsc::UnboundedSender<Option<Value>>,
    },
    Unsubscribe {
        sub_id: u64,
    },
    Request {
        request_id: u64,
        message: NodeMessage,
        reply: oneshot::Sender<Reply>,
    },
}

struct SubEntry {
    collection: String,
    doc_id: String,
    sink: mpsc::UnboundedSender<Option<Value>>,
}

/// Live subscriptions and in-flight requests. Subscriptions outlive a
/// connection and are replayed after reconnecting; requests do not.
#[derive(Default)]
struct Registry {
    subs: HashMap<u64, SubEntry>,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
}

impl Registry {
    /// Records the command and returns the message to put on the wire.
    fn apply(&mut self, command: Command) -> Option<NodeMessage> {
        match command {
            Command::Subscribe {
                sub_id,
                collection,
                doc_id,
                sink,
            } => {
                let message = NodeMessage::Subscribe {
                    sub_id,
                    collection: collection.clone(),
                    doc_id: doc_id.clone(),
                };
                self.subs.insert(
                    sub_id,
                    SubEntry {
                        collection,
                        doc_id,
                        sink,
                    },
                );
                Some(message)
            }
            Command::Unsubscribe { sub_id } => self
                .subs
                .remove(&sub_id)
                .map(|_| NodeMessage::Unsubscribe { sub_id }),
            Command::Request {
                request_id,
                message,
                reply,
            } => {
                self.pending.insert(request_id, reply);
                Some(message)
            }
        }
    }

    /// Same as `apply`, but without a connection: requests fail right away.
    fn apply_offline(&mut self, command: Command) {
        match command {
            Command::Request { request_id, .. } => {
                tracing::debug!("Dropping request {} while disconnected", request_id);
            }
            other => {
                self.apply(other);
            }
        }
    }

    /// Routes a server message. Returns an unsubscribe to send when the
    /// local receiver is gone.
    fn dispatch(&mut self, message: ServerMessage) -> Option<NodeMessage> {
        match message {
            ServerMessage::Snapshot { sub_id, document } => {
                let entry = self.subs.get(&sub_id)?;
                if entry.sink.send(document).is_err() {
                    self.subs.remove(&sub_id);
                    return Some(NodeMessage::Unsubscribe { sub_id });
                }
                None
            }
            ServerMessage::Reply {
                request_id,
                ok,
                document,
                error,
            } => {
                if let Some(reply) = self.pending.remove(&request_id) {
                    let _ = reply.send(Reply {
                        ok,
                        document,
                        error,
                    });
                }
                None
            }
        }
    }

    fn resubscribe_messages(&self) -> Vec<NodeMessage> {
        let mut ids: Vec<&u64> = self.subs.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|sub_id| {
                let entry = &self.subs[sub_id];
                NodeMessage::Subscribe {
                    sub_id: *sub_id,
                    collection: entry.collection.clone(),
                    doc_id: entry.doc_id.clone(),
                }
            })
            .collect()
    }

    fn fail_pending(&mut self) {
        // Dropping the senders wakes every waiter with `Disconnected`.
        self.pending.clear();
    }
}

enum Exit {
    Disconnected,
    Closed,
}

struct ConnectionLoop {
    url: String,
    commands: mpsc::UnboundedReceiver<Command>,
    registry: Registry,
}

impl ConnectionLoop {
    async fn run(mut self) {
        let mut delay = Duration::from_secs(5);
        let max_delay = Duration::from_secs(300);

        loop {
            match self.connect().await {
                Ok(Exit::Closed) => return,
                Ok(Exit::Disconnected) => {
                    delay = Duration::from_secs(5); // Reset delay after a working connection
                }
                Err(e) => {
                    tracing::error!("Document store connection error: {}", e);
                }
            }
            self.registry.fail_pending();

            tracing::info!("Reconnecting in {:?}...", delay);
            let wait = sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.registry.apply_offline(command),
                        None => return,
                    },
                }
            }
            delay = (delay * 2).min(max_delay); // Exponential backoff
        }
    }

    async fn connect(&mut self) -> Result<Exit> {
        let Self {
            url,
            commands,
            registry,
        } = self;

        tracing::info!("Connecting to document store: {}", url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        tracing::info!("Document store connection established");

        let (mut write, mut read) = ws_stream.split();

        for message in registry.resubscribe_messages() {
            send(&mut write, &message).await?;
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        let _ = write.close().await;
                        return Ok(Exit::Closed);
                    };
                    if let Some(message) = registry.apply(command) {
                        send(&mut write, &message).await?;
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                if let Some(reply) = registry.dispatch(message) {
                                    send(&mut write, &reply).await?;
                                }
                            }
                            Err(e) => tracing::warn!("Ignoring unreadable server message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Document store closed connection");
                        return Ok(Exit::Disconnected);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

async fn send<S>(write: &mut S, message: &NodeMessage) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message)?;
    write.send(Message::Text(json)).await?;
    Ok(())
}

/// Document store reached over one multiplexed websocket.
pub struct RemoteStore {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl RemoteStore {
    pub fn connect(server_url: &str, request_timeout: Duration) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let connection = ConnectionLoop {
            url: server_url.to_string(),
            commands: receiver,
            registry: Registry::default(),
        };
        tokio::spawn(connection.run());

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, build: impl FnOnce(u64) -> NodeMessage) -> Result<Reply, StoreError> {
        let request_id = self.next_id();
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                request_id,
                message: build(request_id),
                reply,
            })
            .map_err(|_| StoreError::Disconnected)?;

        match tokio::time::timeout(self.request_timeout, response).await {
            Ok(Ok(reply)) if reply.ok => Ok(reply),
            Ok(Ok(reply)) => Err(StoreError::Rejected(
                reply.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            Ok(Err(_)) => Err(StoreError::Disconnected),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl DocumentStore for RemoteStore {
    fn subscribe(&self, collection: &str, id: &str) -> Subscription {
        let sub_id = self.next_id();
        let (sink, updates) = mpsc::unbounded_channel();

        if self
            .commands
            .send(Command::Subscribe {
                sub_id,
                collection: collection.to_string(),
                doc_id: id.to_string(),
                sink,
            })
            .is_err()
        {
            tracing::error!("Document store client is gone; {}/{} will never update", collection, id);
        }

        let commands = self.commands.clone();
        Subscription {
            updates,
            handle: SubscriptionHandle::new(move || {
                let _ = commands.send(Command::Unsubscribe { sub_id });
            }),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let reply = self
            .request(|request_id| NodeMessage::Get {
                request_id,
                collection: collection.to_string(),
                doc_id: id.to_string(),
            })
            .await?;
        Ok(reply.document)
    }

    async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        self.request(|request_id| NodeMessage::Update {
            request_id,
            collection: collection.to_string(),
            doc_id: id.to_string(),
            fields,
        })
        .await?;
        Ok(())
    }

    async fn find_unpaired_by_code(&self, code: &str) -> Result<Option<String>, StoreError> {
        let reply = self
            .request(|request_id| NodeMessage::FindUnpaired {
                request_id,
                pairing_code: code.to_string(),
            })
            .await?;

        Ok(reply
            .document
            .as_ref()
            .and_then(|doc| doc.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}
