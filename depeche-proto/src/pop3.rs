use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use depeche_meta::model::{MailboxRow, INBOX, TRASH};
use depeche_meta::FlagRewrite;
use depeche_user::error::Error;

use crate::{Account, Backend};

/// Sessions idle longer than this are disconnected.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct Pop3Server {
    bind_addr: SocketAddr,
    backend: Arc<Backend>,
    tls: Option<TlsAcceptor>,
}

impl Pop3Server {
    pub fn new(bind_addr: SocketAddr, backend: Arc<Backend>, tls: Option<TlsAcceptor>) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            backend,
            tls,
        })
    }

    pub async fn run(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("POP3 server listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::info!("POP3: accepted connection from {}", remote_addr);

            let this = self.clone();
            let exit = must_exit.clone();
            let conn = tokio::spawn(async move {
                let res = match this.tls.clone() {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => this.session(stream, exit).await,
                        Err(e) => {
                            tracing::error!(err = ?e, "POP3 TLS negotiation failed");
                            return;
                        }
                    },
                    None => this.session(socket, exit).await,
                };
                if let Err(e) = res {
                    tracing::debug!(addr = %remote_addr, err = %e, "POP3 session ended with error");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("POP3 server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    async fn session<S>(
        self: &Arc<Self>,
        stream: S,
        must_exit: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut read = BufReader::new(read);

        write.write_all(b"+OK Depeche POP3 ready\r\n").await?;

        let mut pending_user: Option<String> = None;
        let mut maildrop: Option<Maildrop> = None;
        let mut line = String::new();

        loop {
            if *must_exit.borrow() {
                write.write_all(b"-ERR server shutting down\r\n").await?;
                return Ok(());
            }

            line.clear();
            let n = match tokio::time::timeout(IDLE_TIMEOUT, read.read_line(&mut line)).await {
                Ok(n) => n?,
                Err(_) => {
                    write.write_all(b"-ERR autologout, bye\r\n").await?;
                    return Ok(());
                }
            };
            if n == 0 {
                return Ok(());
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            let (verb, arg) = match trimmed.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.trim()),
                None => (trimmed.to_ascii_uppercase(), ""),
            };

            match (verb.as_str(), &mut maildrop) {
                ("CAPA", _) => {
                    write
                        .write_all(b"+OK capabilities follow\r\nUSER\r\nUIDL\r\nTOP\r\n.\r\n")
                        .await?;
                }
                ("QUIT", None) => {
                    write.write_all(b"+OK bye\r\n").await?;
                    return Ok(());
                }
                ("QUIT", Some(_)) => {
                    let md = maildrop.take().unwrap();
                    match self.commit(md).await {
                        Ok(()) => write.write_all(b"+OK bye\r\n").await?,
                        Err(e) => {
                            tracing::warn!(err = %e, "POP3 update phase failed");
                            write.write_all(b"-ERR update failed\r\n").await?;
                        }
                    }
                    return Ok(());
                }
                ("NOOP", _) => write.write_all(b"+OK\r\n").await?,

                // Authorization state
                ("USER", None) => {
                    if !self.auth_allowed() {
                        write
                            .write_all(b"-ERR plaintext authentication is disabled\r\n")
                            .await?;
                    } else if arg.is_empty() {
                        write.write_all(b"-ERR missing username\r\n").await?;
                    } else {
                        pending_user = Some(arg.to_string());
                        write.write_all(b"+OK send PASS\r\n").await?;
                    }
                }
                ("PASS", None) => match pending_user.take() {
                    None => write.write_all(b"-ERR send USER first\r\n").await?,
                    Some(user) => match self.backend.login(&user, arg).await {
                        Ok(account) => {
                            let md = self.open_maildrop(account).await?;
                            tracing::info!(user = %user, n = md.messages.len(), "POP3 maildrop opened");
                            write
                                .write_all(
                                    format!("+OK maildrop has {} messages\r\n", md.messages.len())
                                        .as_bytes(),
                                )
                                .await?;
                            maildrop = Some(md);
                        }
                        Err(_) => {
                            write.write_all(b"-ERR authentication failed\r\n").await?
                        }
                    },
                },

                // Transaction state
                ("STAT", Some(md)) => {
                    let (n, size) = md.stat();
                    write
                        .write_all(format!("+OK {} {}\r\n", n, size).as_bytes())
                        .await?;
                }
                ("LIST", Some(md)) => match parse_msg_arg(arg)? {
                    Some(n) => match md.live(n) {
                        Some(m) => {
                            write
                                .write_all(format!("+OK {} {}\r\n", n, m.size).as_bytes())
                                .await?
                        }
                        None => write.write_all(b"-ERR no such message\r\n").await?,
                    },
                    None => {
                        let mut out = String::from("+OK scan listing follows\r\n");
                        for (i, m) in md.iter_live() {
                            out.push_str(&format!("{} {}\r\n", i, m.size));
                        }
                        out.push_str(".\r\n");
                        write.write_all(out.as_bytes()).await?;
                    }
                },
                ("UIDL", Some(md)) => match parse_msg_arg(arg)? {
                    Some(n) => match md.live(n) {
                        Some(m) => {
                            write
                                .write_all(
                                    format!("+OK {} {}\r\n", n, md.uidl(m)).as_bytes(),
                                )
                                .await?
                        }
                        None => write.write_all(b"-ERR no such message\r\n").await?,
                    },
                    None => {
                        let mut out = String::from("+OK\r\n");
                        for (i, m) in md.iter_live() {
                            out.push_str(&format!("{} {}\r\n", i, md.uidl(m)));
                        }
                        out.push_str(".\r\n");
                        write.write_all(out.as_bytes()).await?;
                    }
                },
                ("RETR", Some(md)) => match parse_msg_arg(arg)?.and_then(|n| md.live(n)) {
                    None => write.write_all(b"-ERR no such message\r\n").await?,
                    Some(m) => {
                        let body = self.message_bytes(md.inbox.mailbox_id, m.uid).await?;
                        write
                            .write_all(format!("+OK {} octets\r\n", body.len()).as_bytes())
                            .await?;
                        write.write_all(&byte_stuff(&body)).await?;
                        write.write_all(b".\r\n").await?;
                    }
                },
                ("TOP", Some(md)) => {
                    let (n, k) = match arg.split_once(' ') {
                        Some((n, k)) => (n.trim().parse().ok(), k.trim().parse::<usize>().ok()),
                        None => (None, None),
                    };
                    match (n.and_then(|n| md.live(n)), k) {
                        (Some(m), Some(k)) => {
                            let body = self.message_bytes(md.inbox.mailbox_id, m.uid).await?;
                            let top = top_of(&body, k);
                            write.write_all(b"+OK top follows\r\n").await?;
                            write.write_all(&byte_stuff(&top)).await?;
                            write.write_all(b".\r\n").await?;
                        }
                        _ => write.write_all(b"-ERR bad TOP arguments\r\n").await?,
                    }
                }
                ("DELE", Some(md)) => match parse_msg_arg(arg)? {
                    Some(n) if md.mark_deleted(n) => {
                        write.write_all(b"+OK deleted\r\n").await?
                    }
                    _ => write.write_all(b"-ERR no such message\r\n").await?,
                },
                ("RSET", Some(md)) => {
                    md.reset();
                    write.write_all(b"+OK\r\n").await?;
                }

                _ => write.write_all(b"-ERR unknown or misplaced command\r\n").await?,
            }
        }
    }

    fn auth_allowed(&self) -> bool {
        self.tls.is_some() || self.backend.insecure_auth
    }

    async fn open_maildrop(self: &Arc<Self>, account: Account) -> Result<Maildrop> {
        let inbox = self.backend.meta.get_mailbox_by_name(account.id, INBOX).await?;
        let index = self.backend.meta.list_message_index(inbox.mailbox_id).await?;
        let uids: Vec<u32> = index.iter().map(|(uid, _)| *uid).collect();
        let rows = self
            .backend
            .meta
            .get_messages_by_uids(inbox.mailbox_id, &uids)
            .await?;
        Ok(Maildrop {
            account,
            messages: rows
                .iter()
                .map(|r| Pop3Msg {
                    uid: r.uid,
                    size: r.size,
                    deleted: false,
                })
                .collect(),
            inbox,
        })
    }

    async fn message_bytes(&self, mailbox_id: i64, uid: u32) -> Result<Vec<u8>> {
        let (blob, staging) = self.backend.meta.get_body_ref(mailbox_id, uid).await?;
        Ok(self.backend.bodies.fetch(&blob, staging.as_deref()).await?)
    }

    /// POP3's update phase: messages deleted here follow the same
    /// Trash-redirect semantics as an IMAP expunge.
    async fn commit(&self, md: Maildrop) -> Result<(), Error> {
        let uids: Vec<u32> = md
            .messages
            .iter()
            .filter(|m| m.deleted)
            .map(|m| m.uid)
            .collect();
        if uids.is_empty() {
            return Ok(());
        }
        if md.inbox.name.eq_ignore_ascii_case(TRASH) {
            self.backend.meta.expunge(md.inbox.mailbox_id, &uids).await?;
        } else {
            let trash = self
                .backend
                .meta
                .get_mailbox_by_name(md.account.id, TRASH)
                .await?;
            self.backend
                .meta
                .move_messages(
                    md.inbox.mailbox_id,
                    &uids,
                    trash.mailbox_id,
                    FlagRewrite::trash(),
                )
                .await?;
        }
        Ok(())
    }
}

struct Maildrop {
    account: Account,
    inbox: MailboxRow,
    messages: Vec<Pop3Msg>,
}

struct Pop3Msg {
    uid: u32,
    size: u64,
    deleted: bool,
}

impl Maildrop {
    fn stat(&self) -> (usize, u64) {
        let live: Vec<_> = self.messages.iter().filter(|m| !m.deleted).collect();
        (live.len(), live.iter().map(|m| m.size).sum())
    }

    fn live(&self, n: usize) -> Option<&Pop3Msg> {
        self.messages.get(n.checked_sub(1)?).filter(|m| !m.deleted)
    }

    fn iter_live(&self) -> impl Iterator<Item = (usize, &Pop3Msg)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.deleted)
            .map(|(i, m)| (i + 1, m))
    }

    fn mark_deleted(&mut self, n: usize) -> bool {
        match n
            .checked_sub(1)
            .and_then(|i| self.messages.get_mut(i))
            .filter(|m| !m.deleted)
        {
            Some(m) => {
                m.deleted = true;
                true
            }
            None => false,
        }
    }

    fn reset(&mut self) {
        for m in &mut self.messages {
            m.deleted = false;
        }
    }

    /// UIDLs must be stable across sessions: uidvalidity-qualified UIDs are.
    fn uidl(&self, m: &Pop3Msg) -> String {
        format!("{}.{}", self.inbox.uid_validity, m.uid)
    }
}

fn parse_msg_arg(arg: &str) -> Result<Option<usize>> {
    if arg.is_empty() {
        return Ok(None);
    }
    Ok(arg.parse::<usize>().ok())
}

/// Termination-octet transparency: a line starting with '.' gets one
/// prepended; the message is always terminated CRLF before the final dot.
fn byte_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Headers plus the first `k` lines of the body, for TOP.
fn top_of(body: &[u8], k: usize) -> Vec<u8> {
    let split = body
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .unwrap_or(body.len());
    let (headers, rest) = body.split_at(split);

    let mut out = headers.to_vec();
    for line in rest.split_inclusive(|&b| b == b'\n').take(k) {
        out.extend_from_slice(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_stuffing_doubles_leading_dots() {
        let body = b"a\r\n.hidden\r\nb\r\n";
        let stuffed = byte_stuff(body);
        assert_eq!(&stuffed, b"a\r\n..hidden\r\nb\r\n");
    }

    #[test]
    fn byte_stuffing_terminates_with_crlf() {
        assert!(byte_stuff(b"no trailing newline").ends_with(b"\r\n"));
    }

    #[test]
    fn top_keeps_headers_and_k_lines() {
        let body = b"Subject: x\r\n\r\nline1\r\nline2\r\nline3\r\n";
        let top = top_of(body, 1);
        assert_eq!(&top, b"Subject: x\r\n\r\nline1\r\n");
    }

    #[test]
    fn maildrop_numbering_survives_dele() {
        let mut md = Maildrop {
            account: Account {
                id: 1,
                address: "a@b".into(),
            },
            inbox: MailboxRow {
                mailbox_id: 1,
                account_id: 1,
                name: INBOX.into(),
                parent_id: None,
                uid_validity: 7,
                subscribed: true,
            },
            messages: vec![
                Pop3Msg {
                    uid: 10,
                    size: 100,
                    deleted: false,
                },
                Pop3Msg {
                    uid: 11,
                    size: 200,
                    deleted: false,
                },
            ],
        };

        assert!(md.mark_deleted(1));
        assert!(!md.mark_deleted(1));
        // Message numbers do not shift mid-session.
        assert_eq!(md.live(2).map(|m| m.uid), Some(11));
        assert_eq!(md.stat(), (1, 200));
        assert_eq!(md.uidl(md.live(2).unwrap()), "7.11");

        md.reset();
        assert_eq!(md.stat(), (2, 300));
    }
}
