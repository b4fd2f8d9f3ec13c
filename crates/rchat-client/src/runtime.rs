//! Tokio driver for a [`Session`].
//!
//! One task owns the session and drains a single event queue. Relay calls run
//! as spawned tasks that post their outcome back onto that queue, and timers
//! are sleeping tasks that do the same, so the session is never touched
//! concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rchat_core::{
    ArqConfig, CancelToken, DownloadRequest, DownloadResponse, Notice, PollRequest, PollResponse,
    SendRequest, SendResponse, Session, SessionContext, SessionError, TimerHandle, TimerService,
    TimerToken, Transport, TransportError, UploadChunkRequest, UploadChunkResponse, WindowStatus,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::http::RelayClient;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The event loop has stopped.
    #[error("client disconnected")]
    Disconnected,
}

/// User commands accepted by the event loop.
#[derive(Debug)]
pub enum Command {
    SelectPeer(String),
    SendText(String),
    SendFile { file_name: String, bytes: Vec<u8> },
    Download(String),
    RefreshUsers,
    Status,
    /// Bytes of a completed incoming file.
    Assemble { file_name: String, sender: String },
}

#[derive(Debug)]
pub enum Reply {
    Done,
    Seq(u64),
    Chunks(usize),
    Status(WindowStatus),
    File(Vec<u8>),
}

#[derive(Debug)]
enum Response {
    Send {
        seq: u64,
        result: Result<SendResponse, TransportError>,
    },
    Upload {
        seq: u64,
        result: Result<UploadChunkResponse, TransportError>,
    },
    Poll(Result<PollResponse, TransportError>),
    Download {
        file_name: String,
        result: Result<DownloadResponse, TransportError>,
    },
    Users(Result<Vec<String>, TransportError>),
}

enum Event {
    Command {
        command: Command,
        reply: oneshot::Sender<Result<Reply, SessionError>>,
    },
    Timer {
        handle: TimerHandle,
        token: TimerToken,
    },
    Response(Response),
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// [`SessionContext`] backed by spawned tokio tasks.
///
/// Spawned tasks only hold a weak sender, so the queue closes once the
/// [`Client`] handle is gone.
struct LiveContext {
    relay: RelayClient,
    events: mpsc::WeakUnboundedSender<Event>,
    notices: mpsc::UnboundedSender<Notice>,
    cancel: CancelToken,
    /// Armed timers. A timer is removed when it is cancelled or dispatched.
    timers: HashMap<TimerHandle, JoinHandle<()>>,
    next_handle: u64,
    started: Instant,
}

impl LiveContext {
    fn spawn_request<F>(&self, call: F)
    where
        F: Future<Output = Response> + Send + 'static,
    {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let response = call.await;
            if cancel.is_cancelled() {
                debug!("Dropping response that arrived after disconnect");
                return;
            }
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::Response(response));
            }
        });
    }

    fn abort_timers(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}

impl Transport for LiveContext {
    fn send(&mut self, request: SendRequest) {
        let relay = self.relay.clone();
        self.spawn_request(async move {
            let result = relay.send_message(&request).await;
            Response::Send {
                seq: request.seq,
                result,
            }
        });
    }

    fn upload_chunk(&mut self, request: UploadChunkRequest) {
        let relay = self.relay.clone();
        self.spawn_request(async move {
            let result = relay.upload_chunk(&request).await;
            Response::Upload {
                seq: request.seq,
                result,
            }
        });
    }

    fn poll(&mut self, request: PollRequest) {
        let relay = self.relay.clone();
        self.spawn_request(async move { Response::Poll(relay.receive(&request).await) });
    }

    fn download_file(&mut self, request: DownloadRequest) {
        let relay = self.relay.clone();
        self.spawn_request(async move {
            let result = relay.download_file(&request).await;
            Response::Download {
                file_name: request.file_name,
                result,
            }
        });
    }

    fn list_users(&mut self) {
        let relay = self.relay.clone();
        self.spawn_request(async move { Response::Users(relay.users().await) });
    }
}

impl TimerService for LiveContext {
    fn schedule(&mut self, delay_ms: u64, token: TimerToken) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(Event::Timer { handle, token });
            }
        });
        self.timers.insert(handle, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.timers.remove(&handle) {
            task.abort();
        }
    }
}

impl SessionContext for LiveContext {
    fn notify(&mut self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Handle to a running session. Must be created inside a tokio runtime.
pub struct Client {
    user: String,
    events: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

impl Client {
    /// Connect as `user` and start the event loop.
    ///
    /// Returns the client handle and the stream of session notices.
    pub fn connect(
        relay: RelayClient,
        user: &str,
        config: ArqConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notice>), ClientError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();

        let mut ctx = LiveContext {
            relay,
            events: events_tx.downgrade(),
            notices: notices_tx,
            cancel: cancel.clone(),
            timers: HashMap::new(),
            next_handle: 0,
            started: Instant::now(),
        };
        let session = Session::connect_with_token(&mut ctx, user, config, cancel)?;
        let user = session.user().to_string();
        let task = tokio::spawn(event_loop(session, ctx, events_rx));

        Ok((
            Self {
                user,
                events: events_tx,
                task,
            },
            notices_rx,
        ))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub async fn request(&self, command: Command) -> Result<Reply, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Command { command, reply })
            .map_err(|_| ClientError::Disconnected)?;
        Ok(rx.await.map_err(|_| ClientError::Disconnected)??)
    }

    pub async fn select_peer(&self, peer: &str) -> Result<(), ClientError> {
        self.request(Command::SelectPeer(peer.to_string())).await?;
        Ok(())
    }

    /// Returns the seq assigned to the message.
    pub async fn send_text(&self, text: &str) -> Result<u64, ClientError> {
        match self.request(Command::SendText(text.to_string())).await? {
            Reply::Seq(seq) => Ok(seq),
            other => unreachable_reply(other),
        }
    }

    /// Returns the number of chunks queued.
    pub async fn send_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<usize, ClientError> {
        let command = Command::SendFile {
            file_name: file_name.to_string(),
            bytes,
        };
        match self.request(command).await? {
            Reply::Chunks(count) => Ok(count),
            other => unreachable_reply(other),
        }
    }

    pub async fn status(&self) -> Result<WindowStatus, ClientError> {
        match self.request(Command::Status).await? {
            Reply::Status(status) => Ok(status),
            other => unreachable_reply(other),
        }
    }

    /// Stop polling, cancel every timer and wait for the event loop to end.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();
        self.events
            .send(Event::Disconnect { done })
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)?;
        self.task.await.map_err(|_| ClientError::Disconnected)
    }
}

fn unreachable_reply<T>(reply: Reply) -> Result<T, ClientError> {
    debug!("Unexpected reply {:?}", reply);
    Err(ClientError::Disconnected)
}

async fn event_loop(
    mut session: Session,
    mut ctx: LiveContext,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Command { command, reply } => {
                let result = execute(&mut session, &mut ctx, command);
                let _ = reply.send(result);
            }
            Event::Timer { handle, token } => {
                // Cancelled after it woke up but before we got here.
                if ctx.timers.remove(&handle).is_none() {
                    debug!("Skipping cancelled timer {:?}", handle);
                    continue;
                }
                session.on_timer(&mut ctx, token);
            }
            Event::Response(response) => {
                if ctx.cancel.is_cancelled() {
                    continue;
                }
                match response {
                    Response::Send { seq, result } => {
                        session.on_send_response(&mut ctx, seq, result)
                    }
                    Response::Upload { seq, result } => {
                        session.on_upload_response(&mut ctx, seq, result)
                    }
                    Response::Poll(result) => session.on_poll_response(&mut ctx, result),
                    Response::Download { file_name, result } => {
                        session.on_download_response(&mut ctx, &file_name, result)
                    }
                    Response::Users(result) => session.on_users_response(&mut ctx, result),
                }
            }
            Event::Disconnect { done } => {
                session.disconnect(&mut ctx);
                ctx.abort_timers();
                let _ = done.send(());
                return;
            }
        }
    }

    debug!("Client handle dropped, closing session");
    session.disconnect(&mut ctx);
    ctx.abort_timers();
}

fn execute(
    session: &mut Session,
    ctx: &mut LiveContext,
    command: Command,
) -> Result<Reply, SessionError> {
    match command {
        Command::SelectPeer(peer) => {
            session.select_peer(&peer);
            Ok(Reply::Done)
        }
        Command::SendText(text) => session.send_text(ctx, &text).map(Reply::Seq),
        Command::SendFile { file_name, bytes } => session
            .send_file(ctx, &file_name, &bytes)
            .map(Reply::Chunks),
        Command::Download(file_name) => session.download(ctx, &file_name).map(|_| Reply::Done),
        Command::RefreshUsers => session.refresh_users(ctx).map(|_| Reply::Done),
        Command::Status => Ok(Reply::Status(session.status())),
        Command::Assemble { file_name, sender } => session
            .assemble(&file_name, &sender)
            .map(|bytes| Reply::File(bytes.to_vec())),
    }
}
