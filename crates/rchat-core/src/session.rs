//! One connected chat session.
//!
//! [`Session`] owns every piece of client state: the send window, the ack
//! processor, the receive log, the chunk reassembler and the poll timer. It
//! performs no I/O itself. The driver feeds it user commands, fired timers
//! and transport responses one at a time, and it reacts by issuing requests
//! and notices through a [`SessionContext`].

use std::collections::VecDeque;

use bytes::Bytes;
use rchat_abstract::{
    ArqConfig, DownloadRequest, DownloadResponse, InboundSegment, Notice, Operation, Payload,
    PollRequest, PollResponse, SendResponse, SessionContext, TimerHandle, TimerToken,
    TransportError, UploadChunkResponse,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ack::{AckProcessor, AckSource};
use crate::cancel::CancelToken;
use crate::chunking::{join_chunks, split_file};
use crate::error::SessionError;
use crate::reassembly::ChunkReassembler;
use crate::receive_log::ReceiveLog;
use crate::window::SendWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connected,
    Closed,
}

/// Snapshot of the sender and receiver counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub base: u64,
    pub next: u64,
    pub in_flight: u64,
    pub capacity: usize,
    pub buffered: usize,
    pub queued_chunks: usize,
    pub high_water: i64,
}

pub struct Session {
    user: String,
    peer: Option<String>,
    config: ArqConfig,
    state: SessionState,
    cancel: CancelToken,
    window: SendWindow,
    acks: AckProcessor,
    log: ReceiveLog,
    reassembler: ChunkReassembler,
    /// File chunks waiting for a free window slot, with their receiver.
    outbox: VecDeque<(String, Payload)>,
    poll_timer: Option<TimerHandle>,
    users: Vec<String>,
}

impl Session {
    /// Start a session: arm the poll cycle and fetch the user directory.
    pub fn connect<C>(ctx: &mut C, user: &str, config: ArqConfig) -> Result<Self, SessionError>
    where
        C: SessionContext + ?Sized,
    {
        Self::connect_with_token(ctx, user, config, CancelToken::new())
    }

    /// Like [`Session::connect`], sharing `cancel` with a driver that has to
    /// hold it before the session exists.
    pub fn connect_with_token<C>(
        ctx: &mut C,
        user: &str,
        config: ArqConfig,
        cancel: CancelToken,
    ) -> Result<Self, SessionError>
    where
        C: SessionContext + ?Sized,
    {
        let user = user.trim();
        if user.is_empty() {
            return Err(SessionError::InvalidUser);
        }

        let mut session = Self {
            user: user.to_string(),
            peer: None,
            window: SendWindow::new(user, &config),
            config,
            state: SessionState::Connected,
            cancel,
            acks: AckProcessor::new(),
            log: ReceiveLog::new(),
            reassembler: ChunkReassembler::new(),
            outbox: VecDeque::new(),
            poll_timer: None,
            users: Vec::new(),
        };
        session.poll_timer = Some(ctx.schedule(session.config.poll_interval_ms, TimerToken::Poll));
        ctx.list_users();
        info!("Connected as {}", session.user);
        ctx.notify(Notice::Connected {
            user: session.user.clone(),
        });
        Ok(session)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn config(&self) -> &ArqConfig {
        &self.config
    }

    /// Token that flips when the session is torn down.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    pub fn acks(&self) -> &AckProcessor {
        &self.acks
    }

    pub fn receive_log(&self) -> &ReceiveLog {
        &self.log
    }

    pub fn reassembler(&self) -> &ChunkReassembler {
        &self.reassembler
    }

    /// Other users known to the relay, as of the last directory fetch.
    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn status(&self) -> WindowStatus {
        WindowStatus {
            base: self.window.base(),
            next: self.window.next(),
            in_flight: self.window.in_flight(),
            capacity: self.window.capacity(),
            buffered: self.window.buffered(),
            queued_chunks: self.outbox.len(),
            high_water: self.log.high_water(),
        }
    }

    pub fn select_peer(&mut self, peer: &str) {
        info!("Chatting with {}", peer);
        self.peer = Some(peer.to_string());
    }

    /// Send a text message to the selected peer. Returns its seq.
    pub fn send_text<C>(&mut self, ctx: &mut C, text: &str) -> Result<u64, SessionError>
    where
        C: SessionContext + ?Sized,
    {
        self.ensure_open()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let peer = self.peer.clone().ok_or(SessionError::NoPeer)?;
        self.window
            .try_send(ctx, &peer, Payload::Text(text.to_string()))
    }

    /// Queue a file for upload to the selected peer. Returns the chunk count.
    ///
    /// Chunks enter the window as slots free up, in index order.
    pub fn send_file<C>(
        &mut self,
        ctx: &mut C,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<usize, SessionError>
    where
        C: SessionContext + ?Sized,
    {
        self.ensure_open()?;
        let peer = self.peer.clone().ok_or(SessionError::NoPeer)?;
        let chunks = split_file(file_name, bytes, self.config.chunk_size);
        if chunks.is_empty() {
            return Err(SessionError::EmptyFile(file_name.to_string()));
        }
        let count = chunks.len();
        info!("Uploading {} to {} in {} chunks", file_name, peer, count);
        self.outbox.extend(
            chunks
                .into_iter()
                .map(|chunk| (peer.clone(), Payload::FileChunk(chunk))),
        );
        self.flush_outbox(ctx);
        Ok(count)
    }

    /// Ask the relay for a file addressed to this user.
    pub fn download<C>(&mut self, ctx: &mut C, file_name: &str) -> Result<(), SessionError>
    where
        C: SessionContext + ?Sized,
    {
        self.ensure_open()?;
        ctx.download_file(DownloadRequest {
            file_name: file_name.to_string(),
            receiver: self.user.clone(),
        });
        Ok(())
    }

    pub fn refresh_users<C>(&mut self, ctx: &mut C) -> Result<(), SessionError>
    where
        C: SessionContext + ?Sized,
    {
        self.ensure_open()?;
        ctx.list_users();
        Ok(())
    }

    /// Bytes of a fully received file.
    pub fn assemble(&self, file_name: &str, sender: &str) -> Result<Bytes, SessionError> {
        Ok(self.reassembler.assemble(file_name, sender)?)
    }

    pub fn on_timer<C>(&mut self, ctx: &mut C, token: TimerToken)
    where
        C: SessionContext + ?Sized,
    {
        if !self.is_connected() {
            return;
        }
        match token {
            TimerToken::Retransmit(seq) => {
                if let Some(failure) = self.window.on_timeout(ctx, seq) {
                    ctx.notify(Notice::PermanentSendFailure {
                        seq: failure.seq,
                        retries: failure.retries,
                    });
                    self.flush_outbox(ctx);
                }
            }
            TimerToken::Poll => {
                self.poll_timer = Some(ctx.schedule(self.config.poll_interval_ms, TimerToken::Poll));
                ctx.poll(PollRequest {
                    user: self.user.clone(),
                    last_ack: self.log.high_water(),
                });
            }
        }
    }

    pub fn on_send_response<C>(
        &mut self,
        ctx: &mut C,
        seq: u64,
        result: Result<SendResponse, TransportError>,
    ) where
        C: SessionContext + ?Sized,
    {
        if !self.is_connected() {
            return;
        }
        match result {
            Ok(response) => self.on_inline_ack(ctx, response.ack),
            Err(err) => self.report_transport_error(ctx, Operation::Send, Some(seq), err),
        }
    }

    pub fn on_upload_response<C>(
        &mut self,
        ctx: &mut C,
        seq: u64,
        result: Result<UploadChunkResponse, TransportError>,
    ) where
        C: SessionContext + ?Sized,
    {
        if !self.is_connected() {
            return;
        }
        match result {
            Ok(response) => self.on_inline_ack(ctx, response.ack),
            Err(err) => self.report_transport_error(ctx, Operation::UploadChunk, Some(seq), err),
        }
    }

    pub fn on_poll_response<C>(&mut self, ctx: &mut C, result: Result<PollResponse, TransportError>)
    where
        C: SessionContext + ?Sized,
    {
        if !self.is_connected() {
            return;
        }
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.report_transport_error(ctx, Operation::Poll, None, err);
                return;
            }
        };

        let segments: Vec<InboundSegment> = response
            .messages
            .into_iter()
            .filter_map(|message| match message.into_inbound() {
                Ok(segment) => Some(segment),
                Err(err) => {
                    warn!("Skipping malformed message: {}", err);
                    None
                }
            })
            .collect();
        if !segments.is_empty() {
            let start = self.log.len();
            let ingested = self.log.ingest(segments, &mut self.reassembler);
            debug!(
                "Poll delivered {} segment(s), high-water {}",
                ingested.appended,
                self.log.high_water()
            );
            for segment in &self.log.history()[start..] {
                ctx.notify(Notice::MessageReceived(segment.clone()));
            }
            for file in ingested.completed {
                ctx.notify(Notice::FileReady {
                    file_name: file.file_name,
                    sender: file.sender,
                    total_chunks: file.total_chunks,
                });
            }
        }

        if let Some(ack) = response.ack {
            self.acks
                .apply_ack(&mut self.window, ctx, ack, AckSource::PollResponse);
            self.flush_outbox(ctx);
        }
    }

    pub fn on_download_response<C>(
        &mut self,
        ctx: &mut C,
        file_name: &str,
        result: Result<DownloadResponse, TransportError>,
    ) where
        C: SessionContext + ?Sized,
    {
        if !self.is_connected() {
            return;
        }
        let decoded = result.and_then(|response| {
            if response.chunks.is_empty() {
                return Err(TransportError::Decode(format!("no chunks for {file_name}")));
            }
            join_chunks(&response.chunks).map_err(|err| TransportError::Decode(err.to_string()))
        });
        match decoded {
            Ok(bytes) => {
                info!("Downloaded {} ({} bytes)", file_name, bytes.len());
                ctx.notify(Notice::FileDownloaded {
                    file_name: file_name.to_string(),
                    bytes: bytes.to_vec(),
                });
            }
            Err(err) => self.report_transport_error(ctx, Operation::DownloadFile, None, err),
        }
    }

    pub fn on_users_response<C>(&mut self, ctx: &mut C, result: Result<Vec<String>, TransportError>)
    where
        C: SessionContext + ?Sized,
    {
        if !self.is_connected() {
            return;
        }
        match result {
            Ok(users) => {
                self.users = users.into_iter().filter(|u| *u != self.user).collect();
                ctx.notify(Notice::UsersUpdated(self.users.clone()));
            }
            Err(err) => self.report_transport_error(ctx, Operation::ListUsers, None, err),
        }
    }

    /// Tear down: stop polling, cancel every retransmission timer and
    /// ignore whatever is still in flight.
    pub fn disconnect<C>(&mut self, ctx: &mut C)
    where
        C: SessionContext + ?Sized,
    {
        if !self.is_connected() {
            return;
        }
        self.state = SessionState::Closed;
        self.cancel.cancel();
        if let Some(handle) = self.poll_timer.take() {
            ctx.cancel(handle);
        }
        let cancelled = self.window.cancel_all(ctx);
        let dropped = self.outbox.len();
        self.outbox.clear();
        info!(
            "Disconnected {} ({} timers cancelled, {} segments unacknowledged, {} chunks never sent)",
            self.user,
            cancelled,
            self.window.buffered(),
            dropped
        );
        ctx.notify(Notice::Disconnected);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    fn on_inline_ack<C>(&mut self, ctx: &mut C, ack: Option<i64>)
    where
        C: SessionContext + ?Sized,
    {
        if let Some(ack) = ack {
            self.acks
                .apply_ack(&mut self.window, ctx, ack, AckSource::SendResponse);
            self.flush_outbox(ctx);
        }
    }

    fn flush_outbox<C>(&mut self, ctx: &mut C)
    where
        C: SessionContext + ?Sized,
    {
        while !self.window.is_full() {
            let Some((to, payload)) = self.outbox.pop_front() else {
                break;
            };
            if let Err(err) = self.window.try_send(ctx, &to, payload.clone()) {
                warn!("Queued chunk could not enter the window: {}", err);
                self.outbox.push_front((to, payload));
                break;
            }
        }
    }

    fn report_transport_error<C>(
        &mut self,
        ctx: &mut C,
        operation: Operation,
        seq: Option<u64>,
        err: TransportError,
    ) where
        C: SessionContext + ?Sized,
    {
        warn!("{:?} failed: {}", operation, err);
        ctx.notify(Notice::TransportError {
            operation,
            seq,
            reason: err.to_string(),
        });
    }
}
