//! A [`SessionContext`] that records every request and notice, driven by a
//! logical [`TimerQueue`] clock. Used by unit and integration tests.

use rchat_abstract::{
    DownloadRequest, Notice, PollRequest, SendRequest, SessionContext, TimerHandle, TimerService,
    TimerToken, Transport, UploadChunkRequest,
};

use crate::timer::TimerQueue;

#[derive(Debug, Default)]
pub struct RecordingContext {
    pub timers: TimerQueue,
    pub sent: Vec<SendRequest>,
    pub uploads: Vec<UploadChunkRequest>,
    pub polls: Vec<PollRequest>,
    pub downloads: Vec<DownloadRequest>,
    pub user_lists: usize,
    pub notices: Vec<Notice>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the next timer due at or before `until`.
    pub fn next_timer(&mut self, until: u64) -> Option<TimerToken> {
        self.timers.pop_due(until).map(|(_, token)| token)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Seqs of every send and upload, in issue order per kind.
    pub fn sent_seqs(&self) -> Vec<u64> {
        self.sent.iter().map(|r| r.seq).collect()
    }
}

impl Transport for RecordingContext {
    fn send(&mut self, request: SendRequest) {
        self.sent.push(request);
    }

    fn upload_chunk(&mut self, request: UploadChunkRequest) {
        self.uploads.push(request);
    }

    fn poll(&mut self, request: PollRequest) {
        self.polls.push(request);
    }

    fn download_file(&mut self, request: DownloadRequest) {
        self.downloads.push(request);
    }

    fn list_users(&mut self) {
        self.user_lists += 1;
    }
}

impl TimerService for RecordingContext {
    fn schedule(&mut self, delay_ms: u64, token: TimerToken) -> TimerHandle {
        self.timers.schedule(delay_ms, token)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.timers.cancel(handle);
    }
}

impl SessionContext for RecordingContext {
    fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    fn now(&self) -> u64 {
        self.timers.now()
    }
}
