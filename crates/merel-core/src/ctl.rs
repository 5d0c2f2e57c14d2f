//! Administrative control socket.
//!
//! A line-framed duplex protocol on a unix socket. The server greets with
//! `ctlv0`; each command is a verb line followed by a fixed number of
//! parameter lines. Success is a single `ok` line, failure a single error
//! line. Binary data streams are framed as repeated `<N>\n<N bytes>`
//! chunks, each acknowledged with `ok` by the receiver, terminated by
//! `0\n`.
//!
//! Verb handlers return `Result`; the error display becomes the error
//! line, nothing unwinds across a connection.

use std::path::PathBuf;
use std::sync::Arc;

use merel_common::clock::Clock;
use merel_common::{Error, Result};
use merel_storage::{Message, Store};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::queue::{Queue, QueueFilter};

/// Protocol version greeting.
pub const VERSION: &str = "ctlv0";

const STREAM_CHUNK: usize = 64 * 1024;
/// Refuse absurd chunk sizes rather than allocating them.
const MAX_CHUNK: usize = 1024 * 1024 * 1024;

/// Framing over one control connection.
pub struct Ctl<S> {
    stream: BufStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Ctl<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    /// Read a line without its trailing newline.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Protocol(format!("read: {}", e)))?;
        if n == 0 {
            return Err(Error::Protocol("connection closed".to_string()));
        }
        Ok(line.trim_end_matches('\n').to_string())
    }

    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        self.stream
            .write_all(text.as_bytes())
            .await
            .map_err(|e| Error::Protocol(format!("write: {}", e)))?;
        self.stream
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Protocol(format!("write: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::Protocol(format!("flush: {}", e)))
    }

    pub async fn write_ok(&mut self) -> Result<()> {
        self.write_line("ok").await
    }

    /// Read a line; anything but "ok" is the peer's error.
    pub async fn read_ok(&mut self) -> Result<()> {
        let line = self.read_line().await?;
        if line == "ok" {
            Ok(())
        } else {
            Err(Error::Protocol(line))
        }
    }

    /// Receive a data stream, acknowledging each chunk.
    pub async fn read_stream(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            let line = self.read_line().await?;
            let size: usize = line
                .parse()
                .map_err(|_| Error::Protocol(format!("bad chunk size {:?}", line)))?;
            if size == 0 {
                return Ok(data);
            }
            if size > MAX_CHUNK {
                return Err(Error::Protocol(format!("chunk size {} too large", size)));
            }
            let start = data.len();
            data.resize(start + size, 0);
            self.stream
                .read_exact(&mut data[start..])
                .await
                .map_err(|e| Error::Protocol(format!("read chunk: {}", e)))?;
            self.write_ok().await?;
        }
    }

    /// Send a data stream, waiting for each chunk's acknowledgement.
    pub async fn write_stream(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(STREAM_CHUNK) {
            self.write_line(&chunk.len().to_string()).await?;
            self.stream
                .write_all(chunk)
                .await
                .map_err(|e| Error::Protocol(format!("write chunk: {}", e)))?;
            self.stream
                .flush()
                .await
                .map_err(|e| Error::Protocol(format!("flush: {}", e)))?;
            self.read_ok().await?;
        }
        self.write_line("0").await
    }
}

type LogLevelSetter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// The control socket server.
pub struct CtlServer {
    store: Arc<Store>,
    queue: Arc<Queue>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<Notify>,
    log_level: std::sync::Mutex<String>,
    set_log_level: LogLevelSetter,
}

impl CtlServer {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<Queue>,
        clock: Arc<dyn Clock>,
        shutdown: Arc<Notify>,
        initial_log_level: String,
        set_log_level: LogLevelSetter,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            clock,
            shutdown,
            log_level: std::sync::Mutex::new(initial_log_level),
            set_log_level,
        })
    }

    /// Accept control connections until shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        info!("control socket listening");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("control socket shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_conn(stream).await {
                                    debug!(error = %e, "control connection ended");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accepting control connection"),
                    }
                }
            }
        }
    }

    async fn handle_conn(&self, stream: UnixStream) -> Result<()> {
        let mut ctl = Ctl::new(stream);
        ctl.write_line(VERSION).await?;

        loop {
            let verb = match ctl.read_line().await {
                Ok(verb) => verb,
                Err(_) => return Ok(()), // client went away
            };
            debug!(cmd = %verb, "control command");
            let stop = verb == "stop";
            if let Err(e) = self.command(&verb, &mut ctl).await {
                let msg = e.to_string().replace('\n', " ");
                ctl.write_line(&msg).await?;
            }
            if stop {
                return Ok(());
            }
        }
    }

    async fn command<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        verb: &str,
        ctl: &mut Ctl<S>,
    ) -> Result<()> {
        match verb {
            "stop" => {
                ctl.write_ok().await?;
                info!("shutdown requested over control socket");
                self.shutdown.notify_waiters();
                Ok(())
            }
            "deliver" => {
                let address = ctl.read_line().await?;
                let data = ctl.read_stream().await?;
                self.deliver(&address, &data).await?;
                ctl.write_ok().await
            }
            "setaccountpassword" => {
                let account = ctl.read_line().await?;
                let password = ctl.read_line().await?;
                let acc = self.store.account(&account).await?;
                acc.set_password(&password).await?;
                ctl.write_ok().await
            }
            "queue" => {
                let list = self.queue.list().await?;
                ctl.write_ok().await?;
                let mut out = String::new();
                for qm in list {
                    out.push_str(&format!(
                        "{} {} {} {} attempts={} next={} error={:?}\n",
                        qm.id,
                        qm.queued_at.to_rfc3339(),
                        qm.sender().map(|s| s.to_string()).unwrap_or_else(|| "<>".to_string()),
                        qm.recipient(),
                        qm.attempts,
                        qm.next_attempt.to_rfc3339(),
                        qm.last_error.as_deref().unwrap_or(""),
                    ));
                }
                ctl.write_stream(out.as_bytes()).await
            }
            "queuekick" => {
                let (filter, transport) = read_queue_filter(ctl, true).await?;
                let count = self.queue.kick(&filter, transport.as_deref()).await?;
                ctl.write_ok().await?;
                ctl.write_line(&count.to_string()).await
            }
            "queuedrop" => {
                let (filter, _) = read_queue_filter(ctl, false).await?;
                let count = self.queue.drop_messages(&filter).await?;
                ctl.write_ok().await?;
                ctl.write_line(&count.to_string()).await
            }
            "queuedump" => {
                let line = ctl.read_line().await?;
                let id: i64 = line
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad queue id {:?}", line)))?;
                let data = self.queue.open_message(id).await?;
                ctl.write_ok().await?;
                ctl.write_stream(&data).await
            }
            "retrain" => {
                let account = ctl.read_line().await?;
                let acc = self.store.account(&account).await?;
                let trained = acc.retrain().await?;
                info!(account = %account, trained, "retrained junk filter over control socket");
                ctl.write_ok().await
            }
            "loglevels" => {
                let level = self.log_level.lock().unwrap().clone();
                ctl.write_ok().await?;
                ctl.write_stream(level.as_bytes()).await
            }
            "setloglevels" => {
                let level = ctl.read_line().await?;
                if !(self.set_log_level)(&level) {
                    return Err(Error::Validation(format!("invalid log level {:?}", level)));
                }
                *self.log_level.lock().unwrap() = level;
                ctl.write_ok().await
            }
            // Owned by external tools: importers, config management, the
            // backup tool.
            "importmaildir" | "importmbox" | "domainadd" | "domainrm" | "accountadd"
            | "accountrm" | "addressadd" | "addressrm" | "backup" => {
                Err(Error::Validation(format!("unsupported command {:?}", verb)))
            }
            _ => Err(Error::Validation("unknown or unsupported command".to_string())),
        }
    }

    /// Deliver a locally generated or injected message to an address.
    async fn deliver(&self, address: &str, data: &[u8]) -> Result<()> {
        let (account, canonical, dest) = self.store.open_email(address).await?;

        let tmp_dir = self.store.data_dir().join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let tmp: PathBuf = tmp_dir.join(format!("ctl-{}.eml", rand::random::<u64>()));
        tokio::fs::write(&tmp, data).await?;

        let mut msg = Message {
            received_at: self.clock.now(),
            ..Message::default()
        };
        if let Some(addr) = merel_common::types::EmailAddress::parse(&canonical) {
            msg.rcpt_to_localpart = addr.localpart;
            msg.rcpt_to_domain = addr.domain;
        }
        let mailbox = dest.mailbox.as_deref().unwrap_or("Inbox");
        let delivered = account.deliver_mailbox(mailbox, &mut msg, &tmp, true).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            warn!(error = %e, "removing ctl spool file");
        }
        delivered?;
        info!(address = %canonical, id = msg.id, "delivered over control socket");
        Ok(())
    }
}

async fn read_queue_filter<S: AsyncRead + AsyncWrite + Unpin>(
    ctl: &mut Ctl<S>,
    with_transport: bool,
) -> Result<(QueueFilter, Option<String>)> {
    let id_line = ctl.read_line().await?;
    let todomain = ctl.read_line().await?;
    let recipient = ctl.read_line().await?;
    let transport = if with_transport {
        Some(ctl.read_line().await?)
    } else {
        None
    };

    let id = if id_line.is_empty() {
        None
    } else {
        Some(
            id_line
                .parse()
                .map_err(|_| Error::Validation(format!("bad queue id {:?}", id_line)))?,
        )
    };
    Ok((
        QueueFilter {
            id,
            todomain: (!todomain.is_empty()).then_some(todomain),
            recipient: (!recipient.is_empty()).then_some(recipient),
        },
        transport.filter(|t| !t.is_empty()),
    ))
}

/// Client side of the control protocol, used by the admin CLI and tests.
pub struct CtlClient {
    ctl: Ctl<UnixStream>,
}

impl CtlClient {
    pub async fn connect(path: &std::path::Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| Error::Protocol(format!("connecting to {}: {}", path.display(), e)))?;
        let mut ctl = Ctl::new(stream);
        let version = ctl.read_line().await?;
        if version != VERSION {
            return Err(Error::Protocol(format!(
                "protocol mismatch, got {:?}, expected {:?}",
                version, VERSION
            )));
        }
        Ok(Self { ctl })
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.ctl.write_line("stop").await?;
        self.ctl.read_ok().await
    }

    pub async fn deliver(&mut self, address: &str, data: &[u8]) -> Result<()> {
        self.ctl.write_line("deliver").await?;
        self.ctl.write_line(address).await?;
        self.ctl.write_stream(data).await?;
        self.ctl.read_ok().await
    }

    pub async fn set_account_password(&mut self, account: &str, password: &str) -> Result<()> {
        self.ctl.write_line("setaccountpassword").await?;
        self.ctl.write_line(account).await?;
        self.ctl.write_line(password).await?;
        self.ctl.read_ok().await
    }

    pub async fn queue_list(&mut self) -> Result<String> {
        self.ctl.write_line("queue").await?;
        self.ctl.read_ok().await?;
        let data = self.ctl.read_stream().await?;
        Ok(String::from_utf8_lossy(&data).to_string())
    }

    pub async fn queue_kick(
        &mut self,
        id: Option<i64>,
        todomain: &str,
        recipient: &str,
        transport: &str,
    ) -> Result<u64> {
        self.ctl.write_line("queuekick").await?;
        self.ctl
            .write_line(&id.map(|v| v.to_string()).unwrap_or_default())
            .await?;
        self.ctl.write_line(todomain).await?;
        self.ctl.write_line(recipient).await?;
        self.ctl.write_line(transport).await?;
        self.ctl.read_ok().await?;
        let count = self.ctl.read_line().await?;
        count
            .parse()
            .map_err(|_| Error::Protocol(format!("bad count {:?}", count)))
    }

    pub async fn queue_drop(
        &mut self,
        id: Option<i64>,
        todomain: &str,
        recipient: &str,
    ) -> Result<u64> {
        self.ctl.write_line("queuedrop").await?;
        self.ctl
            .write_line(&id.map(|v| v.to_string()).unwrap_or_default())
            .await?;
        self.ctl.write_line(todomain).await?;
        self.ctl.write_line(recipient).await?;
        self.ctl.read_ok().await?;
        let count = self.ctl.read_line().await?;
        count
            .parse()
            .map_err(|_| Error::Protocol(format!("bad count {:?}", count)))
    }

    pub async fn queue_dump(&mut self, id: i64) -> Result<Vec<u8>> {
        self.ctl.write_line("queuedump").await?;
        self.ctl.write_line(&id.to_string()).await?;
        self.ctl.read_ok().await?;
        self.ctl.read_stream().await
    }

    pub async fn retrain(&mut self, account: &str) -> Result<()> {
        self.ctl.write_line("retrain").await?;
        self.ctl.write_line(account).await?;
        self.ctl.read_ok().await
    }

    pub async fn log_levels(&mut self) -> Result<String> {
        self.ctl.write_line("loglevels").await?;
        self.ctl.read_ok().await?;
        let data = self.ctl.read_stream().await?;
        Ok(String::from_utf8_lossy(&data).to_string())
    }

    pub async fn set_log_levels(&mut self, level: &str) -> Result<()> {
        self.ctl.write_line("setloglevels").await?;
        self.ctl.write_line(level).await?;
        self.ctl.read_ok().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merel_common::clock::SystemClock;
    use merel_common::config::Config;
    use merel_common::types::EmailAddress;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<CtlServer>, PathBuf, Arc<Queue>, Arc<Store>) {
        let toml = r#"
            [domains."merel.example"]

            [accounts.mjl]
            domain = "merel.example"

            [accounts.mjl.destinations.mjl]
            mailbox = "Inbox"

            [accounts.mjl.junk_filter]
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.data_dir = dir.path().join("data");
        let config = Arc::new(config);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(Store::open(config.clone()).await.unwrap());
        let queue = Arc::new(
            Queue::open(&config.data_dir.join("queue"), clock.clone())
                .await
                .unwrap(),
        );

        let server = CtlServer::new(
            store.clone(),
            queue.clone(),
            clock,
            Arc::new(Notify::new()),
            "info".to_string(),
            Box::new(|level| !level.is_empty()),
        );

        let socket = dir.path().join("ctl");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(server.clone().serve(listener));
        (server, socket, queue, store)
    }

    #[tokio::test]
    async fn test_greeting_and_unknown_command() {
        let dir = TempDir::new().unwrap();
        let (_, socket, _, _) = setup(&dir).await;

        let mut client = CtlClient::connect(&socket).await.unwrap();
        let err = client.retrain("nosuch").await.unwrap_err();
        assert!(err.to_string().contains("nosuch"));

        // Unknown verbs get a single error line and the connection stays
        // usable.
        client.ctl.write_line("fly-to-the-moon").await.unwrap();
        let line = client.ctl.read_line().await.unwrap();
        assert_eq!(line, "unknown or unsupported command");
        assert_eq!(client.log_levels().await.unwrap(), "info");
    }

    #[tokio::test]
    async fn test_deliver_and_queue_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (_, socket, queue, store) = setup(&dir).await;
        let mut client = CtlClient::connect(&socket).await.unwrap();

        client
            .deliver("mjl@merel.example", b"Subject: injected\r\n\r\nhello\r\n")
            .await
            .unwrap();
        let acc = store.account("mjl").await.unwrap();
        assert_eq!(acc.message_count("Inbox").await.unwrap(), 1);

        // Queue one message and inspect it over the socket.
        let sender = EmailAddress::parse("mjl@merel.example").unwrap();
        let rcpt = EmailAddress::parse("remote@example.org").unwrap();
        let id = queue.add(Some(&sender), &rcpt, "", false, b"outbound").await.unwrap();

        let listing = client.queue_list().await.unwrap();
        assert!(listing.contains("remote@example.org"));

        assert_eq!(client.queue_dump(id).await.unwrap(), b"outbound");

        assert_eq!(client.queue_kick(Some(id), "", "", "null").await.unwrap(), 1);
        assert_eq!(queue.get(id).await.unwrap().transport, "null");

        assert_eq!(client.queue_drop(None, "example.org", "").await.unwrap(), 1);
        assert!(queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_password_and_loglevels() {
        let dir = TempDir::new().unwrap();
        let (_, socket, _, store) = setup(&dir).await;
        let mut client = CtlClient::connect(&socket).await.unwrap();

        client.set_account_password("mjl", "s3cret").await.unwrap();
        let acc = store.account("mjl").await.unwrap();
        assert!(acc.verify_password("s3cret").await.unwrap());

        client.set_log_levels("debug").await.unwrap();
        assert_eq!(client.log_levels().await.unwrap(), "debug");
        assert!(client.set_log_levels("").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_notifies_shutdown() {
        let dir = TempDir::new().unwrap();
        let (server, socket, _, _) = setup(&dir).await;

        let notified = {
            let shutdown = server.shutdown.clone();
            tokio::spawn(async move { shutdown.notified().await })
        };
        let mut client = CtlClient::connect(&socket).await.unwrap();
        client.stop().await.unwrap();
        notified.await.unwrap();
    }
}
