//! IPC server implementation

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use tutor_api::{ClientInfo, ClientRole, Command, Event, Recipient, Request, Response};
use tutor_notify::RealtimeEmitter;
use tutor_util::ClientId;

use crate::{IpcError, IpcResult};

/// Message from client to server
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

/// An event and the party it is addressed to
#[derive(Debug, Clone)]
struct RoutedEvent {
    recipient: Recipient,
    event: Event,
}

/// IPC Server
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    event_tx: broadcast::Sender<RoutedEvent>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    message_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>>,
}

struct ClientHandle {
    info: ClientInfo,
    response_tx: mpsc::UnboundedSender<String>,
    /// Recipient whose events this client receives
    subscription: Option<Recipient>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            message_tx,
            message_rx: Arc::new(Mutex::new(Some(message_rx))),
        }
    }

    /// Start listening
    pub async fn start(&mut self) -> IpcResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Owner and group only
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");

        self.listener = Some(listener);

        Ok(())
    }

    /// Get receiver for server messages
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.message_rx.lock().await.take()
    }

    /// Emitter that routes events to subscribed clients
    pub fn emitter(&self) -> IpcEmitter {
        IpcEmitter {
            event_tx: self.event_tx.clone(),
        }
    }

    /// Accept connections in a loop
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let client_id = ClientId::new();
                    let uid = get_peer_uid(&stream);

                    let role = match uid {
                        Some(0) => ClientRole::Admin,
                        Some(u) if u == nix::unistd::getuid().as_raw() => ClientRole::Admin,
                        _ => ClientRole::Client,
                    };

                    let info = ClientInfo::new(role);
                    let info = if let Some(u) = uid {
                        info.with_uid(u)
                    } else {
                        info
                    };

                    info!(client_id = %client_id, uid = ?uid, role = ?role, "Client connected");

                    self.handle_client(stream, client_id, info).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream, client_id: ClientId, info: ClientInfo) {
        let (read_half, write_half) = stream.into_split();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<String>();

        {
            let mut clients = self.clients.write().await;
            clients.insert(
                client_id.clone(),
                ClientHandle {
                    info: info.clone(),
                    response_tx: response_tx.clone(),
                    subscription: None,
                },
            );
        }

        let _ = self.message_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info: info.clone(),
        });

        let clients = self.clients.clone();
        let message_tx = self.message_tx.clone();
        let reader_id = client_id.clone();
        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

        // Reader: parse requests, track subscriptions, forward to the daemon
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(client_id = %reader_id, "Client disconnected (EOF)");
                        break;
                    }
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }

                        match serde_json::from_str::<Request>(line) {
                            Ok(request) => {
                                let subscription = match &request.command {
                                    Command::SubscribeEvents { recipient } => {
                                        Some(Some(recipient.clone()))
                                    }
                                    Command::UnsubscribeEvents => Some(None),
                                    _ => None,
                                };
                                if let Some(subscription) = subscription {
                                    let mut clients = clients.write().await;
                                    if let Some(handle) = clients.get_mut(&reader_id) {
                                        debug!(
                                            client_id = %reader_id,
                                            recipient = ?subscription,
                                            "Subscription changed"
                                        );
                                        handle.subscription = subscription;
                                    }
                                }

                                let _ = message_tx.send(ServerMessage::Request {
                                    client_id: reader_id.clone(),
                                    request,
                                });
                            }
                            Err(e) => {
                                warn!(client_id = %reader_id, error = %e, "Invalid request");
                            }
                        }
                    }
                    Err(e) => {
                        debug!(client_id = %reader_id, error = %e, "Read error");
                        break;
                    }
                }
            }

            let _ = closed_tx.send(());
        });

        // Writer: responses, plus events addressed to the subscribed recipient
        let mut event_rx = self.event_tx.subscribe();
        let clients_writer = self.clients.clone();
        let writer_id = client_id;
        let message_tx_writer = self.message_tx.clone();

        tokio::spawn(async move {
            let mut writer = write_half;

            loop {
                tokio::select! {
                    Some(response) = response_rx.recv() => {
                        let mut msg = response;
                        msg.push('\n');
                        if let Err(e) = writer.write_all(msg.as_bytes()).await {
                            debug!(client_id = %writer_id, error = %e, "Write error");
                            break;
                        }
                    }

                    received = event_rx.recv() => {
                        let routed = match received {
                            Ok(routed) => routed,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(client_id = %writer_id, skipped, "Client fell behind on events");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };

                        let wanted = {
                            let clients = clients_writer.read().await;
                            clients
                                .get(&writer_id)
                                .and_then(|h| h.subscription.as_ref())
                                .is_some_and(|r| *r == routed.recipient)
                        };

                        if wanted && let Ok(mut msg) = serde_json::to_string(&routed.event) {
                            msg.push('\n');
                            if let Err(e) = writer.write_all(msg.as_bytes()).await {
                                debug!(client_id = %writer_id, error = %e, "Event write error");
                                break;
                            }
                        }
                    }

                    _ = &mut closed_rx => break,
                }
            }

            let _ = message_tx_writer.send(ServerMessage::ClientDisconnected {
                client_id: writer_id.clone(),
            });

            let mut clients = clients_writer.write().await;
            clients.remove(&writer_id);
        });
    }

    /// Send a response to a specific client
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let json = serde_json::to_string(&response)?;

        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(client_id) {
            handle
                .response_tx
                .send(json)
                .map_err(|_| IpcError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Get client info
    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|h| h.info.clone())
    }

    /// Get connected client count
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// [`RealtimeEmitter`] backed by the IPC server's event channel
#[derive(Clone)]
pub struct IpcEmitter {
    event_tx: broadcast::Sender<RoutedEvent>,
}

impl RealtimeEmitter for IpcEmitter {
    fn emit(&self, recipient: &Recipient, event: Event) {
        let name = event.name();
        let routed = RoutedEvent {
            recipient: recipient.clone(),
            event,
        };
        if self.event_tx.send(routed).is_err() {
            debug!(recipient = %recipient, event = name, "No clients connected for event");
        }
    }
}

/// Get peer UID from Unix socket
fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    let fd = stream.as_fd();

    match nix::sys::socket::getsockopt(&fd, nix::sys::socket::sockopt::PeerCredentials) {
        Ok(cred) => Some(cred.uid()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcClient;
    use std::time::Duration;
    use tempfile::tempdir;
    use tutor_api::{EventPayload, ResponsePayload};
    use tutor_util::{SessionId, TeacherId, UserId};

    #[tokio::test]
    async fn test_server_start() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();

        assert!(socket_path.exists());
    }

    /// Answer every request the way the daemon answers subscriptions
    async fn serve(server: Arc<IpcServer>) {
        let mut messages = server.take_message_receiver().await.unwrap();
        let accept = server.clone();
        tokio::spawn(async move {
            let _ = accept.run().await;
        });
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                if let ServerMessage::Request { client_id, request } = msg {
                    let response = Response::success(
                        request.request_id,
                        ResponsePayload::Subscribed {
                            client_id: client_id.clone(),
                        },
                    );
                    let _ = server.send_response(&client_id, response).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn events_reach_only_their_recipient() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("events.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let emitter = server.emitter();
        serve(server.clone()).await;

        let student = Recipient::User(UserId::new("u1"));
        let teacher = Recipient::Teacher(TeacherId::new("t1"));

        let mut student_events = IpcClient::connect(&socket_path)
            .await
            .unwrap()
            .subscribe(student.clone())
            .await
            .unwrap();
        let mut teacher_events = IpcClient::connect(&socket_path)
            .await
            .unwrap()
            .subscribe(teacher.clone())
            .await
            .unwrap();

        let session_id = SessionId::new();
        emitter.emit(
            &student,
            Event::new(EventPayload::SessionStarting {
                session_id: session_id.clone(),
                meeting_link: None,
            }),
        );

        let event = tokio::time::timeout(Duration::from_secs(2), student_events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "session_starting");

        let nothing = tokio::time::timeout(Duration::from_millis(200), teacher_events.next()).await;
        assert!(nothing.is_err());

        emitter.emit(
            &teacher,
            Event::new(EventPayload::MeetingLinkSet {
                session_id,
                meeting_link: "https://meet.example/x".into(),
            }),
        );
        let event = tokio::time::timeout(Duration::from_secs(2), teacher_events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "meeting_link_set");
    }

    #[tokio::test]
    async fn subscriber_stays_connected_until_dropped() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("linger.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let emitter = server.emitter();
        serve(server.clone()).await;

        let student = Recipient::User(UserId::new("u1"));
        let mut events = IpcClient::connect(&socket_path)
            .await
            .unwrap()
            .subscribe(student.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.client_count().await, 1);

        emitter.emit(
            &student,
            Event::new(EventPayload::SessionStarting {
                session_id: SessionId::new(),
                meeting_link: None,
            }),
        );
        let event = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "session_starting");

        drop(events);
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.client_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }
}
