//! Inbound side of the content filter: the MTA hands each message over SMTP.
//!
//! Only what a Postfix `content_filter` needs is spoken here, on a loopback
//! socket, without TLS or authentication.

use std::io;
use std::mem::take;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// One complete SMTP transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub sender: String,
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

/// Processes a received transaction and returns the reply line for DATA.
///
/// Called on a blocking thread.
pub trait TransactionHandler: Send + Sync + 'static {
    fn handle(&self, transaction: Transaction) -> String;
}

/// Accepts connections until the listener fails.
pub async fn serve<H: TransactionHandler>(listener: TcpListener, handler: Arc<H>) -> io::Result<()> {
    info!("[smtp] listening on {}", listener.local_addr()?);
    loop {
        let (socket, peer) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            debug!("[smtp] connection from {}", peer);
            if let Err(e) = handle_connection(socket, peer, handler).await {
                warn!("[smtp] connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

#[derive(Debug, Default)]
struct Session {
    sender: Option<String>,
    recipients: Vec<String>,
}

impl Session {
    fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}

async fn handle_connection<S, H>(stream: S, peer: SocketAddr, handler: Arc<H>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: TransactionHandler,
{
    let (reader, mut writer) = split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = Session::default();
    let mut line = Vec::new();

    reply(&mut writer, "220 localhost ESMTP fwdfilter").await?;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            debug!("[smtp] {} closed the connection", peer);
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        let (verb, arg) = text.split_once(' ').unwrap_or((text, ""));

        match verb.to_ascii_uppercase().as_str() {
            "EHLO" => reply(&mut writer, "250-localhost\r\n250 8BITMIME").await?,
            "HELO" => reply(&mut writer, "250 localhost").await?,
            "MAIL" => match parse_path(arg, "FROM:") {
                Some(sender) => {
                    session.reset();
                    session.sender = Some(sender);
                    reply(&mut writer, "250 OK").await?;
                }
                None => reply(&mut writer, "501 Syntax: MAIL FROM:<address>").await?,
            },
            "RCPT" => {
                if session.sender.is_none() {
                    reply(&mut writer, "503 Need MAIL before RCPT").await?;
                    continue;
                }
                match parse_path(arg, "TO:").filter(|path| !path.is_empty()) {
                    Some(recipient) => {
                        session.recipients.push(recipient);
                        reply(&mut writer, "250 OK").await?;
                    }
                    None => reply(&mut writer, "501 Syntax: RCPT TO:<address>").await?,
                }
            }
            "DATA" => {
                let Some(sender) = session.sender.take() else {
                    reply(&mut writer, "503 Need MAIL before DATA").await?;
                    continue;
                };
                if session.recipients.is_empty() {
                    session.sender = Some(sender);
                    reply(&mut writer, "554 No valid recipients").await?;
                    continue;
                }
                reply(&mut writer, "354 End data with <CR><LF>.<CR><LF>").await?;
                let data = read_data(&mut reader).await?;
                let transaction = Transaction {
                    sender,
                    recipients: take(&mut session.recipients),
                    data,
                };
                debug!(
                    "[smtp] {} sent {} bytes for {} recipient(s)",
                    peer,
                    transaction.data.len(),
                    transaction.recipients.len()
                );

                let worker = Arc::clone(&handler);
                let status = match tokio::task::spawn_blocking(move || worker.handle(transaction))
                    .await
                {
                    Ok(status) => status,
                    Err(e) => {
                        error!("[smtp] transaction from {} aborted: {}", peer, e);
                        "451 Local error in processing".to_string()
                    }
                };
                reply(&mut writer, &status).await?;
            }
            "RSET" => {
                session.reset();
                reply(&mut writer, "250 OK").await?;
            }
            "NOOP" => reply(&mut writer, "250 OK").await?,
            "QUIT" => {
                reply(&mut writer, "221 Bye").await?;
                return Ok(());
            }
            _ => {
                debug!("[smtp] unsupported command from {}: {}", peer, verb);
                reply(&mut writer, "502 Command not implemented").await?;
            }
        }
    }
}

/// Reads the message up to the lone `.` line, undoing dot-stuffing.
async fn read_data<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut data = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            ));
        }
        if line == b".\r\n" || line == b".\n" {
            return Ok(data);
        }
        match line.strip_prefix(b".") {
            Some(rest) => data.extend_from_slice(rest),
            None => data.extend_from_slice(&line),
        }
    }
}

/// Extracts the address of `FROM:<a@b> PARAMS`; `<>` yields an empty string.
fn parse_path(arg: &str, keyword: &str) -> Option<String> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start();
    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        return Some(inner[..end].trim().to_string());
    }
    rest.split_whitespace().next().map(str::to_string)
}

async fn reply<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}
