//! Read-only IMAP client over rustls.
//!
//! The protocol work is blocking and runs on `spawn_blocking`. Only the
//! handful of commands the relay needs are spoken: LOGIN, EXAMINE,
//! UID SEARCH, UID FETCH BODY.PEEK[] and LOGOUT. EXAMINE plus PEEK keep
//! the server-side `\Seen` flags untouched.

use std::future::Future;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::parser::parse_message;
use super::provider::ImapEndpoint;
use super::{AttachmentCache, Credentials, ExternalMessage, MailboxConnector, MailboxSession, SearchFilter};
use crate::config::ImapConfig;
use crate::error::MailboxError;
use crate::store::Account;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Opens [`ImapSession`]s for accounts, retrying transient failures.
pub struct ImapConnector {
    config: ImapConfig,
    segment_size: usize,
}

impl ImapConnector {
    pub fn new(config: ImapConfig, segment_size: usize) -> Self {
        Self {
            config,
            segment_size,
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let endpoint = account.provider.imap();
        let credentials = account.credentials.clone();
        let read_timeout = self.config.read_timeout;

        let conn = with_retries(
            endpoint.host,
            self.config.connect_attempts,
            self.config.connect_backoff,
            || {
                let credentials = credentials.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        ImapConnection::open(endpoint, &credentials, read_timeout)
                    })
                    .await
                    .map_err(|e| MailboxError::Protocol(format!("IMAP worker failed: {e}")))?
                }
            },
        )
        .await?;

        info!(
            account_id = account.id,
            host = endpoint.host,
            exists = conn.exists,
            "IMAP session opened"
        );

        Ok(Box::new(ImapSession {
            conn: Some(conn),
            listing_quirk: self.config.listing_quirk,
            segment_size: self.segment_size,
        }))
    }
}

/// Run `op` up to `attempts` times with a fixed sleep between tries.
///
/// Authentication failures are returned at once; retrying a rejected
/// password only risks a lockout.
async fn with_retries<T, F, Fut>(
    host: &str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, MailboxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MailboxError>>,
{
    let attempts = attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e @ MailboxError::AuthFailed { .. }) => return Err(e),
            Err(e) => {
                warn!(host, attempt, attempts, error = %e, "IMAP connect attempt failed");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(MailboxError::ConnectFailed {
        host: host.to_string(),
        attempts,
        reason: last_error,
    })
}

/// An open session. The blocking connection is moved into each
/// `spawn_blocking` call and handed back afterwards.
pub struct ImapSession {
    conn: Option<ImapConnection<TlsStream>>,
    listing_quirk: bool,
    segment_size: usize,
}

impl ImapSession {
    async fn run<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapConnection<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| MailboxError::Protocol("IMAP session is closed".into()))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP worker failed: {e}")))?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn list_ids(&mut self, filter: SearchFilter) -> Result<Vec<u32>, MailboxError> {
        let (ids, exists) = self
            .run(move |conn| {
                let ids = conn.search(filter)?;
                Ok((ids, conn.exists))
            })
            .await?;
        // EXISTS only counts the same set as an unfiltered search.
        let exists = (filter == SearchFilter::All).then_some(exists);
        Ok(complete_listing(ids, exists, self.listing_quirk))
    }

    async fn fetch(
        &mut self,
        id: u32,
        cache: &AttachmentCache,
    ) -> Result<ExternalMessage, MailboxError> {
        let raw = self.run(move |conn| conn.fetch_raw(id)).await?;
        let parsed = parse_message(id, &raw, self.segment_size)?;

        let mut message = parsed.message;
        for attachment in parsed.attachments {
            match cache.save(id, &attachment.name, &attachment.contents).await {
                Ok(path) => message.attachments.push(path),
                Err(e) => {
                    warn!(message_id = id, name = %attachment.name, error = %e, "Failed to cache attachment");
                }
            }
        }
        debug!(
            message_id = id,
            segments = message.segments.len(),
            attachments = message.attachments.len(),
            "Message fetched"
        );
        Ok(message)
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.run(|conn| conn.logout()).await {
            debug!(error = %e, "IMAP logout failed");
        }
    }
}

/// Sort and dedup a listing. With the quirk enabled, a listing that is
/// shorter than the mailbox's EXISTS count gets `max + 1` appended,
/// since some providers leave the newest message out of SEARCH results.
pub fn complete_listing(mut ids: Vec<u32>, exists: Option<u32>, quirk: bool) -> Vec<u32> {
    ids.sort_unstable();
    ids.dedup();
    let max = ids.last().copied();
    if quirk
        && let (Some(max), Some(exists)) = (max, exists)
        && exists as usize > ids.len()
        && let Some(next) = max.checked_add(1)
    {
        ids.push(next);
    }
    ids
}

// ── Blocking protocol ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One untagged response, with any `{N}` literals it carried.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Response {
    untagged: Vec<ResponseLine>,
    status: Status,
    status_text: String,
}

struct ImapConnection<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
    /// Message count last reported by the server.
    exists: u32,
}

impl ImapConnection<TlsStream> {
    /// Connect, authenticate and open INBOX read-only.
    fn open(
        endpoint: ImapEndpoint,
        credentials: &Credentials,
        read_timeout: Duration,
    ) -> Result<Self, MailboxError> {
        let addr = (endpoint.host, endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| MailboxError::Protocol(format!("{} did not resolve", endpoint.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, read_timeout)?;
        tcp.set_read_timeout(Some(read_timeout))?;
        tcp.set_write_timeout(Some(read_timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.to_string())
            .map_err(|e| MailboxError::Protocol(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Protocol(format!("TLS setup failed: {e}")))?;

        let mut imap = ImapConnection::new(rustls::StreamOwned::new(conn, tcp));
        imap.greeting()?;
        imap.login(credentials)?;
        imap.examine_inbox()?;
        Ok(imap)
    }
}

impl<S: Read + Write> ImapConnection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
            exists: 0,
        }
    }

    fn greeting(&mut self) -> Result<(), MailboxError> {
        let line = read_response_line(&mut self.stream)?;
        if line.text.starts_with("* OK") || line.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Protocol(format!("unexpected greeting: {}", line.text)))
        }
    }

    fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("R{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        stream.flush()?;

        let response = read_response(&mut self.stream, &tag)?;
        for line in &response.untagged {
            if let Some(n) = parse_exists(&line.text) {
                self.exists = n;
            }
        }
        Ok(response)
    }

    fn login(&mut self, credentials: &Credentials) -> Result<(), MailboxError> {
        let cmd = format!(
            "LOGIN {} {}",
            quote(&credentials.address),
            quote(credentials.secret.expose_secret())
        );
        let response = self.command(&cmd)?;
        match response.status {
            Status::Ok => Ok(()),
            Status::No => Err(MailboxError::AuthFailed {
                address: credentials.address.clone(),
            }),
            Status::Bad => Err(MailboxError::Protocol(format!(
                "LOGIN rejected: {}",
                response.status_text
            ))),
        }
    }

    fn examine_inbox(&mut self) -> Result<(), MailboxError> {
        let response = self.command("EXAMINE INBOX")?;
        expect_ok("EXAMINE", &response)
    }

    fn search(&mut self, filter: SearchFilter) -> Result<Vec<u32>, MailboxError> {
        let response = self.command(&format!("UID SEARCH {}", filter.as_imap()))?;
        expect_ok("SEARCH", &response)?;
        Ok(response
            .untagged
            .iter()
            .filter_map(|line| parse_search(&line.text))
            .flatten()
            .collect())
    }

    fn fetch_raw(&mut self, id: u32) -> Result<Vec<u8>, MailboxError> {
        let response = self.command(&format!("UID FETCH {id} BODY.PEEK[]"))?;
        expect_ok("FETCH", &response)?;
        response
            .untagged
            .into_iter()
            .filter(|line| line.text.to_ascii_uppercase().contains(" FETCH "))
            .find_map(|line| line.literals.into_iter().next())
            .ok_or(MailboxError::NotFound { id })
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT").map(|_| ())
    }
}

fn expect_ok(command: &str, response: &Response) -> Result<(), MailboxError> {
    match response.status {
        Status::Ok => Ok(()),
        _ => Err(MailboxError::Protocol(format!(
            "{command} failed: {}",
            response.status_text
        ))),
    }
}

fn read_raw_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, MailboxError> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Err(MailboxError::Protocol("connection closed by server".into()));
    }
    Ok(buf)
}

/// Read one logical response line, pulling in literals as they appear.
fn read_response_line<R: BufRead>(reader: &mut R) -> Result<ResponseLine, MailboxError> {
    let mut line = ResponseLine::default();
    loop {
        let raw = read_raw_line(reader)?;
        line.text
            .push_str(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']));
        match literal_len(&raw) {
            Some(n) => {
                let mut literal = vec![0u8; n];
                reader.read_exact(&mut literal)?;
                line.literals.push(literal);
            }
            None => return Ok(line),
        }
    }
}

fn read_response<R: BufRead>(reader: &mut R, tag: &str) -> Result<Response, MailboxError> {
    let mut untagged = Vec::new();
    loop {
        let line = read_response_line(reader)?;
        if let Some(rest) = line.text.strip_prefix(tag).and_then(|r| r.strip_prefix(' ')) {
            let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let status = match word.to_ascii_uppercase().as_str() {
                "OK" => Status::Ok,
                "NO" => Status::No,
                "BAD" => Status::Bad,
                other => {
                    return Err(MailboxError::Protocol(format!("unknown status {other}")));
                }
            };
            return Ok(Response {
                untagged,
                status,
                status_text: text.to_string(),
            });
        }
        untagged.push(line);
    }
}

/// Size of the literal announced at the end of a raw line, as in
/// `* 12 FETCH (BODY[] {342}\r\n`.
fn literal_len(raw: &[u8]) -> Option<usize> {
    let line = std::str::from_utf8(raw).ok()?.trim_end_matches(['\r', '\n']);
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

fn parse_search(text: &str) -> Option<Vec<u32>> {
    let rest = text.strip_prefix("* SEARCH")?;
    Some(
        rest.split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect(),
    )
}

fn parse_exists(text: &str) -> Option<u32> {
    let rest = text.strip_prefix("* ")?;
    let (n, word) = rest.split_once(' ')?;
    if word.trim().eq_ignore_ascii_case("EXISTS") {
        n.parse().ok()
    } else {
        None
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
