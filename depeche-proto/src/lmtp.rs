use std::net::SocketAddr;
use std::{pin::Pin, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use duplexify::Duplex;
use futures::{io, stream, stream::FuturesUnordered, AsyncRead, AsyncReadExt, AsyncWrite, StreamExt};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

use smtp_message::{Email, EscapedDataReader, Reply, ReplyCode};
use smtp_server::{reply, Config, ConnectionMetadata, Decision, MailMetadata};

use depeche_meta::model::{FlagSet, MailboxId, INBOX};
use depeche_user::config::LmtpConfig;

use crate::Backend;

pub struct LmtpServer {
    bind_addr: SocketAddr,
    hostname: String,
    backend: Arc<Backend>,
    tls: Option<TlsAcceptor>,
    must_exit: watch::Receiver<bool>,
}

impl LmtpServer {
    pub fn new(
        bind_addr: SocketAddr,
        config: &LmtpConfig,
        backend: Arc<Backend>,
        tls: Option<TlsAcceptor>,
        must_exit: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            hostname: config.hostname.clone(),
            backend,
            tls,
            must_exit,
        })
    }

    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut must_exit = self.must_exit.clone();
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("LMTP server listening on {:#}", self.bind_addr);

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

            let conn = tokio::spawn(smtp_server::interact(
                socket.compat(),
                smtp_server::IsAlreadyTls::No,
                Conn { remote_addr },
                self.clone(),
            ));

            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("LMTP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

// ----

pub struct Conn {
    remote_addr: SocketAddr,
}

pub struct Message {
    to: Vec<Rcpt>,
}

struct Rcpt {
    address: String,
    inbox: MailboxId,
}

#[async_trait]
impl Config for LmtpServer {
    type Protocol = smtp_server::protocol::Lmtp;

    type ConnectionUserMeta = Conn;
    type MailUserMeta = Message;

    fn hostname(&self, _conn_meta: &ConnectionMetadata<Conn>) -> &str {
        &self.hostname
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<Conn>) -> Message {
        Message { to: vec![] }
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> io::Result<Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: Send + AsyncRead + AsyncWrite,
    {
        let acceptor = self.tls.clone().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "TLS is not configured")
        })?;

        let tls_stream = acceptor.accept(Box::pin(io).compat()).await?;
        let (read, write) = tls_stream.compat().split();
        Ok(Duplex::new(
            Box::pin(read) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(write) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    async fn filter_from(
        &self,
        from: Option<Email>,
        _meta: &mut MailMetadata<Message>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Option<Email>> {
        Decision::Accept {
            reply: reply::okay_from().convert(),
            res: from,
        }
    }

    async fn filter_to(
        &self,
        to: Email,
        meta: &mut MailMetadata<Message>,
        _conn_meta: &mut ConnectionMetadata<Conn>,
    ) -> Decision<Email> {
        let to_str = match to.hostname.as_ref() {
            Some(h) => format!("{}@{}", to.localpart, h),
            None => to.localpart.to_string(),
        };
        match self.resolve_rcpt(&to_str).await {
            Ok(rcpt) => {
                meta.user.to.push(rcpt);
                Decision::Accept {
                    reply: reply::okay_to().convert(),
                    res: to,
                }
            }
            Err(e) => Decision::Reject {
                reply: Reply {
                    code: ReplyCode::POLICY_REASON,
                    ecode: None,
                    text: vec![smtp_message::MaybeUtf8::Utf8(e.to_string())],
                },
            },
        }
    }

    async fn handle_mail<'resp, R>(
        &'resp self,
        reader: &mut EscapedDataReader<'_, R>,
        meta: MailMetadata<Message>,
        conn_meta: &'resp mut ConnectionMetadata<Conn>,
    ) -> Pin<Box<dyn futures::Stream<Item = Decision<()>> + Send + 'resp>>
    where
        R: Send + Unpin + AsyncRead,
    {
        let err_response_stream = |meta: MailMetadata<Message>, msg: String| {
            Box::pin(
                stream::iter(meta.user.to.into_iter()).map(move |_| Decision::Reject {
                    reply: Reply {
                        code: ReplyCode::POLICY_REASON,
                        ecode: None,
                        text: vec![smtp_message::MaybeUtf8::Utf8(msg.clone())],
                    },
                }),
            )
        };

        let mut text = Vec::new();
        if reader.read_to_end(&mut text).await.is_err() {
            return err_response_stream(meta, "io error".into());
        }
        reader.complete();

        tracing::debug!(
            from = %conn_meta.user.remote_addr,
            size = text.len(),
            rcpt = meta.user.to.len(),
            "lmtp data received"
        );

        let text = Arc::new(text);
        let backend = self.backend.clone();
        let must_exit = self.must_exit.clone();

        // LMTP's defining feature: one status line per recipient.
        Box::pin(stream::iter(meta.user.to.into_iter()).then(move |rcpt| {
            let text = text.clone();
            let backend = backend.clone();
            let must_exit = must_exit.clone();
            async move {
                let res = backend
                    .ingest
                    .deliver(
                        &rcpt.address,
                        rcpt.inbox,
                        FlagSet::default(),
                        Utc::now(),
                        &text,
                        &must_exit,
                    )
                    .await;
                match res {
                    Ok(_) => Decision::Accept {
                        reply: reply::okay_mail().convert(),
                        res: (),
                    },
                    Err(e) => Decision::Reject {
                        reply: Reply {
                            code: ReplyCode::POLICY_REASON,
                            ecode: None,
                            text: vec![smtp_message::MaybeUtf8::Utf8(e.to_string())],
                        },
                    },
                }
            }
        }))
    }
}

impl LmtpServer {
    /// RCPT resolution: account must exist, its INBOX is the destination
    /// (default mailboxes are provisioned on first delivery too).
    async fn resolve_rcpt(&self, address: &str) -> depeche_user::error::Result<Rcpt> {
        let account_id = self.backend.meta.account_for_delivery(address).await?;
        self.backend.meta.create_default_mailboxes(account_id).await?;
        let inbox = self
            .backend
            .meta
            .get_mailbox_by_name(account_id, INBOX)
            .await?;
        Ok(Rcpt {
            address: address.to_string(),
            inbox: inbox.mailbox_id,
        })
    }
}
