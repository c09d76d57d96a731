//! In-memory fakes for the mailbox and chat platform seams.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{MailboxError, PlatformError};
use crate::mailbox::{
    AttachmentCache, ExternalMessage, MailboxConnector, MailboxSession, SearchFilter,
};
use crate::platform::ChatPlatform;
use crate::store::Account;

// ── Platform ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub group_id: i64,
    pub thread_id: i64,
    pub text: String,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub group_id: i64,
    pub thread_id: i64,
    pub path: PathBuf,
    pub reply_to: Option<i64>,
    /// Whether the file still existed at send time.
    pub existed: bool,
}

#[derive(Default)]
struct PlatformState {
    next_id: i64,
    topics: Vec<(i64, String, i64)>,
    texts: Vec<SentText>,
    files: Vec<SentFile>,
    send_attempts: usize,
    create_delay: Option<Duration>,
    create_error: Option<PlatformError>,
    text_errors: VecDeque<PlatformError>,
    file_errors: VecDeque<PlatformError>,
    missing_threads: HashSet<i64>,
}

impl PlatformState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Records everything sent; failures are scripted per call.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    /// The next `create_thread` fails with `err`.
    pub fn fail_create_with(&self, err: PlatformError) {
        self.state.lock().unwrap().create_error = Some(err);
    }

    /// Queue an error for an upcoming `send_text` call.
    pub fn push_text_error(&self, err: PlatformError) {
        self.state.lock().unwrap().text_errors.push_back(err);
    }

    pub fn push_file_error(&self, err: PlatformError) {
        self.state.lock().unwrap().file_errors.push_back(err);
    }

    /// Sends into `thread_id` fail as if the topic was deleted.
    pub fn delete_thread(&self, thread_id: i64) {
        self.state.lock().unwrap().missing_threads.insert(thread_id);
    }

    pub fn topics_created(&self) -> usize {
        self.state.lock().unwrap().topics.len()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.state.lock().unwrap().topics.iter().map(|t| t.1.clone()).collect()
    }

    pub fn texts(&self) -> Vec<SentText> {
        self.state.lock().unwrap().texts.clone()
    }

    pub fn files(&self) -> Vec<SentFile> {
        self.state.lock().unwrap().files.clone()
    }

    /// `send_text` calls, including failed ones.
    pub fn send_attempts(&self) -> usize {
        self.state.lock().unwrap().send_attempts
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    async fn create_thread(&self, group_id: i64, name: &str) -> Result<i64, PlatformError> {
        let delay = self.state.lock().unwrap().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.create_error.take() {
            return Err(err);
        }
        let id = state.next_id();
        state.topics.push((group_id, name.to_string(), id));
        Ok(id)
    }

    async fn send_text(
        &self,
        group_id: i64,
        thread_id: i64,
        text: &str,
    ) -> Result<i64, PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.send_attempts += 1;
        if let Some(err) = state.text_errors.pop_front() {
            return Err(err);
        }
        if state.missing_threads.contains(&thread_id) {
            return Err(PlatformError::ThreadNotFound("message thread not found".into()));
        }
        let message_id = state.next_id();
        state.texts.push(SentText {
            group_id,
            thread_id,
            text: text.to_string(),
            message_id,
        });
        Ok(message_id)
    }

    async fn send_file(
        &self,
        group_id: i64,
        thread_id: i64,
        path: &Path,
        reply_to: Option<i64>,
    ) -> Result<i64, PlatformError> {
        let existed = path.exists();
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.file_errors.pop_front() {
            return Err(err);
        }
        if state.missing_threads.contains(&thread_id) {
            return Err(PlatformError::ThreadNotFound("message thread not found".into()));
        }
        let message_id = state.next_id();
        state.files.push(SentFile {
            group_id,
            thread_id,
            path: path.to_path_buf(),
            reply_to,
            existed,
        });
        Ok(message_id)
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// A message as the fake server holds it.
#[derive(Debug, Clone)]
pub struct FakeMail {
    pub sender_name: Option<String>,
    pub sender_address: String,
    pub subject: Option<String>,
    pub segments: Vec<String>,
    pub attachments: Vec<(String, Vec<u8>)>,
}

impl FakeMail {
    pub fn text(sender: &str, body: &str) -> Self {
        Self {
            sender_name: None,
            sender_address: sender.to_string(),
            subject: Some("hello".to_string()),
            segments: vec![body.to_string()],
            attachments: Vec::new(),
        }
    }
}

#[derive(Default)]
struct MailboxState {
    mail: HashMap<i64, BTreeMap<u32, FakeMail>>,
    /// Ids the listing reports but a fetch cannot find.
    phantom: HashMap<i64, Vec<u32>>,
    unavailable: HashSet<i64>,
}

/// Per-account fake inboxes.
#[derive(Default, Clone)]
pub struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
    connects: Arc<AtomicUsize>,
    fetches: Arc<AtomicUsize>,
}

impl FakeMailbox {
    pub fn add(&self, account_id: i64, id: u32, mail: FakeMail) {
        self.state
            .lock()
            .unwrap()
            .mail
            .entry(account_id)
            .or_default()
            .insert(id, mail);
    }

    pub fn add_phantom(&self, account_id: i64, id: u32) {
        self.state.lock().unwrap().phantom.entry(account_id).or_default().push(id);
    }

    pub fn set_unavailable(&self, account_id: i64, unavailable: bool) {
        let mut state = self.state.lock().unwrap();
        if unavailable {
            state.unavailable.insert(account_id);
        } else {
            state.unavailable.remove(&account_id);
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxConnector for FakeMailbox {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailboxSession>, MailboxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().unwrap().unavailable.contains(&account.id) {
            return Err(MailboxError::ConnectFailed {
                host: "fake".into(),
                attempts: 3,
                reason: "unreachable".into(),
            });
        }
        Ok(Box::new(FakeSession {
            mailbox: self.clone(),
            account_id: account.id,
        }))
    }
}

struct FakeSession {
    mailbox: FakeMailbox,
    account_id: i64,
}

#[async_trait]
impl MailboxSession for FakeSession {
    async fn list_ids(&mut self, _filter: SearchFilter) -> Result<Vec<u32>, MailboxError> {
        let state = self.mailbox.state.lock().unwrap();
        let mut ids: Vec<u32> = state
            .mail
            .get(&self.account_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        if let Some(phantom) = state.phantom.get(&self.account_id) {
            ids.extend(phantom);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn fetch(
        &mut self,
        id: u32,
        cache: &AttachmentCache,
    ) -> Result<ExternalMessage, MailboxError> {
        self.mailbox.fetches.fetch_add(1, Ordering::SeqCst);
        let mail = self
            .mailbox
            .state
            .lock()
            .unwrap()
            .mail
            .get(&self.account_id)
            .and_then(|m| m.get(&id))
            .cloned()
            .ok_or(MailboxError::NotFound { id })?;

        let mut attachments = Vec::new();
        for (name, contents) in &mail.attachments {
            attachments.push(cache.save(id, name, contents).await?);
        }
        Ok(ExternalMessage {
            id,
            sender_name: mail.sender_name,
            sender_address: mail.sender_address,
            subject: mail.subject,
            date: None,
            segments: mail.segments,
            attachments,
        })
    }

    async fn close(self: Box<Self>) {}
}
