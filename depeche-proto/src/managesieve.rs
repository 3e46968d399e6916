use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use base64::Engine;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use depeche_user::error::Error;

use crate::{Account, Backend};

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}
type BoxStream = Box<dyn Stream>;

pub struct ManageSieveServer {
    bind_addr: SocketAddr,
    backend: Arc<Backend>,
    tls: Option<TlsAcceptor>,
}

impl ManageSieveServer {
    pub fn new(bind_addr: SocketAddr, backend: Arc<Backend>, tls: Option<TlsAcceptor>) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            backend,
            tls,
        })
    }

    pub async fn run(self: &Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("ManageSieve server listening on {:#}", self.bind_addr);

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
            tracing::info!("ManageSieve: accepted connection from {}", remote_addr);

            let this = self.clone();
            let exit = must_exit.clone();
            let conn = tokio::spawn(async move {
                if let Err(e) = this.session(Box::new(socket), false, exit).await {
                    tracing::debug!(addr = %remote_addr, err = %e, "ManageSieve session ended with error");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("ManageSieve server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    /// The whole RFC 5804 command loop. After STARTTLS the session restarts
    /// itself once over the wrapped stream.
    fn session<'a>(
        self: &'a Arc<Self>,
        stream: BoxStream,
        secure: bool,
        must_exit: watch::Receiver<bool>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut read = BufReader::new(read);

            self.greet(&mut write, secure, true).await?;

            let mut account: Option<Account> = None;
            let mut line = String::new();

            loop {
                if *must_exit.borrow() {
                    write.write_all(b"BYE \"server shutting down\"\r\n").await?;
                    return Ok(());
                }

                line.clear();
                if read.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                let mut args = parse_line(&mut read, &line).await?;
                if args.is_empty() {
                    continue;
                }
                let verb = args.remove(0).to_ascii_uppercase();

                match (verb.as_str(), &account) {
                    ("CAPABILITY", _) => self.greet(&mut write, secure, false).await?,
                    ("NOOP", _) => write.write_all(b"OK \"noop\"\r\n").await?,
                    ("LOGOUT", _) => {
                        write.write_all(b"OK \"bye\"\r\n").await?;
                        return Ok(());
                    }
                    ("STARTTLS", None) if !secure => match self.tls.clone() {
                        Some(acceptor) => {
                            write.write_all(b"OK \"begin TLS now\"\r\n").await?;
                            let plain = read.into_inner().unsplit(write);
                            let tls_stream = acceptor.accept(plain).await?;
                            return self.session(Box::new(tls_stream), true, must_exit).await;
                        }
                        None => {
                            write.write_all(b"NO \"TLS is not configured\"\r\n").await?
                        }
                    },
                    ("AUTHENTICATE", None) => {
                        if !secure && !self.backend.insecure_auth {
                            write
                                .write_all(b"NO \"plaintext authentication is disabled\"\r\n")
                                .await?;
                            continue;
                        }
                        match self.authenticate(&args, &mut read).await {
                            Ok(acct) => {
                                tracing::info!(user = %acct.address, "managesieve authenticated");
                                account = Some(acct);
                                write.write_all(b"OK \"authenticated\"\r\n").await?;
                            }
                            Err(e) => {
                                tracing::debug!(err = %e, "managesieve authentication failed");
                                write.write_all(b"NO \"authentication failed\"\r\n").await?;
                            }
                        }
                    }
                    ("HAVESPACE", Some(_)) => {
                        // Scripts live in the catalog; no separate quota.
                        write.write_all(b"OK \"space available\"\r\n").await?;
                    }
                    ("LISTSCRIPTS", Some(acct)) => {
                        let scripts = self.backend.meta.list_sieve_scripts(acct.id).await?;
                        let mut out = String::new();
                        for s in scripts {
                            out.push_str(&format!(
                                "\"{}\"{}\r\n",
                                escape_string(&s.name),
                                if s.active { " ACTIVE" } else { "" }
                            ));
                        }
                        out.push_str("OK \"listscripts completed\"\r\n");
                        write.write_all(out.as_bytes()).await?;
                    }
                    ("GETSCRIPT", Some(acct)) => match args.first() {
                        Some(name) => {
                            match self.backend.meta.get_sieve_script(acct.id, name).await {
                                Ok(script) => {
                                    write
                                        .write_all(
                                            format!(
                                                "{{{}}}\r\n{}\r\nOK \"getscript completed\"\r\n",
                                                script.content.len(),
                                                script.content
                                            )
                                            .as_bytes(),
                                        )
                                        .await?;
                                }
                                Err(_) => {
                                    write
                                        .write_all(b"NO (NONEXISTENT) \"no such script\"\r\n")
                                        .await?
                                }
                            }
                        }
                        None => write.write_all(b"NO \"missing script name\"\r\n").await?,
                    },
                    ("PUTSCRIPT", Some(acct)) => match (args.first(), args.get(1)) {
                        (Some(name), Some(content)) => {
                            self.backend
                                .meta
                                .put_sieve_script(acct.id, name, content)
                                .await?;
                            write.write_all(b"OK \"putscript completed\"\r\n").await?;
                        }
                        _ => {
                            write
                                .write_all(b"NO \"missing script name or content\"\r\n")
                                .await?
                        }
                    },
                    ("SETACTIVE", Some(acct)) => match args.first() {
                        Some(name) => {
                            let target = if name.is_empty() {
                                None
                            } else {
                                Some(name.as_str())
                            };
                            match self
                                .backend
                                .meta
                                .set_active_sieve_script(acct.id, target)
                                .await
                            {
                                Ok(()) => {
                                    write.write_all(b"OK \"setactive completed\"\r\n").await?
                                }
                                Err(_) => {
                                    write
                                        .write_all(b"NO (NONEXISTENT) \"no such script\"\r\n")
                                        .await?
                                }
                            }
                        }
                        None => write.write_all(b"NO \"missing script name\"\r\n").await?,
                    },
                    ("DELETESCRIPT", Some(acct)) => match args.first() {
                        Some(name) => {
                            match self.backend.meta.delete_sieve_script(acct.id, name).await {
                                Ok(()) => {
                                    write.write_all(b"OK \"deletescript completed\"\r\n").await?
                                }
                                Err(Error::Permission(_)) => {
                                    write
                                        .write_all(b"NO (ACTIVE) \"script is active\"\r\n")
                                        .await?
                                }
                                Err(_) => {
                                    write
                                        .write_all(b"NO (NONEXISTENT) \"no such script\"\r\n")
                                        .await?
                                }
                            }
                        }
                        None => write.write_all(b"NO \"missing script name\"\r\n").await?,
                    },
                    _ => {
                        write
                            .write_all(b"NO \"unknown or misplaced command\"\r\n")
                            .await?
                    }
                }
            }
        })
    }

    async fn greet<W>(&self, write: &mut W, secure: bool, with_ok: bool) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut out = String::new();
        out.push_str("\"IMPLEMENTATION\" \"Depeche\"\r\n");
        out.push_str("\"SIEVE\" \"fileinto vacation\"\r\n");
        out.push_str("\"SASL\" \"PLAIN\"\r\n");
        out.push_str("\"VERSION\" \"1.0\"\r\n");
        if !secure && self.tls.is_some() {
            out.push_str("\"STARTTLS\"\r\n");
        }
        if with_ok {
            out.push_str("OK \"Depeche ManageSieve ready\"\r\n");
        } else {
            out.push_str("OK \"capability completed\"\r\n");
        }
        write.write_all(out.as_bytes()).await?;
        Ok(())
    }

    /// AUTHENTICATE "PLAIN" ["<base64>"]: authzid \0 authcid \0 password,
    /// where a distinct authzid is a master-proxy login.
    async fn authenticate<R>(&self, args: &[String], read: &mut R) -> Result<Account>
    where
        R: AsyncBufReadExt + Unpin,
    {
        let mechanism = args.first().map(|s| s.to_ascii_uppercase());
        if mechanism.as_deref() != Some("PLAIN") {
            bail!("unsupported SASL mechanism");
        }
        let b64 = match args.get(1) {
            Some(b) => b.clone(),
            None => {
                let mut line = String::new();
                read.read_line(&mut line).await?;
                line.trim().trim_matches('"').to_string()
            }
        };

        let decoded = base64::engine::general_purpose::STANDARD.decode(b64.trim())?;
        let mut parts = decoded.split(|&b| b == 0);
        let authzid = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
        let authcid = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
        let password = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();

        let username = if !authzid.is_empty() && authzid != authcid {
            format!("{}\0{}", authzid, authcid)
        } else {
            authcid
        };
        Ok(self.backend.login(&username, &password).await?)
    }
}

/// Tokenize one command line: atoms, quoted strings, and `{n+}` literals
/// whose bytes follow on the wire.
async fn parse_line<R>(read: &mut R, line: &str) -> Result<Vec<String>>
where
    R: AsyncReadExt + AsyncBufReadExt + Unpin,
{
    let mut out = Vec::new();
    let mut rest = line.trim_end_matches(['\r', '\n']);

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped
                .find('"')
                .ok_or_else(|| anyhow::anyhow!("unterminated string"))?;
            out.push(stripped[..end].to_string());
            rest = &stripped[end + 1..];
        } else if rest.starts_with('{') {
            let end = rest.find('}').ok_or_else(|| anyhow::anyhow!("bad literal"))?;
            let n: usize = rest[1..end].trim_end_matches('+').parse()?;
            let mut buf = vec![0u8; n];
            read.read_exact(&mut buf).await?;
            // Swallow the CRLF terminating the literal.
            let mut crlf = String::new();
            read.read_line(&mut crlf).await?;
            out.push(String::from_utf8_lossy(&buf).to_string());
            rest = "";
        } else {
            let end = rest.find(' ').unwrap_or(rest.len());
            out.push(rest[..end].to_string());
            rest = &rest[end..];
        }
    }
    Ok(out)
}

fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_atoms_and_strings() {
        let mut empty: &[u8] = b"";
        let mut reader = BufReader::new(&mut empty);
        let args = parse_line(&mut reader, "PUTSCRIPT \"my script\" \"keep;\"\r\n")
            .await
            .unwrap();
        assert_eq!(args, vec!["PUTSCRIPT", "my script", "keep;"]);
    }

    #[tokio::test]
    async fn parses_literals() {
        let mut tail: &[u8] = b"if true { keep; }\r\n";
        let mut reader = BufReader::new(&mut tail);
        let args = parse_line(&mut reader, "PUTSCRIPT \"s\" {17+}\r\n")
            .await
            .unwrap();
        assert_eq!(args, vec!["PUTSCRIPT", "s", "if true { keep; }"]);
    }

    #[test]
    fn escapes_names() {
        assert_eq!(escape_string("a\"b"), "a\\\"b");
    }
}
