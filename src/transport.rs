//! Team sessions over TCP.
//!
//! A session is a stream of newline-delimited JSON objects. The client opens it with a
//! [`Hello`] naming its team; from then on every line it sends is handed to the
//! [`MatchController`], except health replies which are routed to whoever is probing the
//! connection.
//!
//! Every write is bounded by a deadline. A message cut short by its deadline leaves a torn line
//! on the wire, so the connection is shut down and the team has to reconnect.

use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::controller::MatchController;
use crate::protocol::{ClientMessage, Hello, ServerMessage};
use crate::registry::{Connection, ProbeOutcome};

/// Time a new client has to introduce itself.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Time a send may take when the caller sets no deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of a TCP session.
#[derive(Debug)]
pub struct TcpConnection {
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    health_rx: Mutex<Receiver<()>>,
}

/// Reading half of a session. Health replies are forwarded to the matching
/// [`TcpConnection::probe`].
#[derive(Debug)]
pub struct SessionReader {
    reader: BufReader<TcpStream>,
    health_tx: Sender<()>,
}

impl TcpConnection {
    /// Splits `stream` into its writing and reading halves.
    pub fn new(stream: TcpStream) -> io::Result<(Arc<TcpConnection>, SessionReader)> {
        let peer = stream.peer_addr()?;
        let (health_tx, health_rx) = mpsc::channel();
        let reader = SessionReader {
            reader: BufReader::new(stream.try_clone()?),
            health_tx,
        };
        let connection = TcpConnection {
            peer,
            writer: Mutex::new(stream),
            health_rx: Mutex::new(health_rx),
        };
        Ok((Arc::new(connection), reader))
    }

    /// Address of the client.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Writes all of `buf` unless `deadline` passes first. Returns the error along with the number
/// of bytes already written.
fn write_before(
    stream: &mut TcpStream,
    buf: &[u8],
    deadline: Instant,
) -> Result<(), (usize, io::Error)> {
    let mut written = 0;
    while written < buf.len() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err((written, ErrorKind::TimedOut.into()));
        }
        stream
            .set_write_timeout(Some(left))
            .map_err(|e| (written, e))?;
        match stream.write(&buf[written..]) {
            Ok(0) => return Err((written, ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err((written, ErrorKind::TimedOut.into()))
            }
            Err(e) => return Err((written, e)),
        }
    }
    Ok(())
}

impl Connection for TcpConnection {
    fn send(&self, message: &ServerMessage) -> anyhow::Result<()> {
        self.send_before(message, Instant::now() + WRITE_TIMEOUT)
    }

    fn send_before(&self, message: &ServerMessage, deadline: Instant) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut stream = self.writer.lock().expect("poisoned");
        match write_before(&mut stream, &line, deadline) {
            Ok(()) => Ok(()),
            Err((0, e)) => Err(anyhow!(e).context(format!("send to {}", self.peer))),
            Err((written, e)) => {
                warn!(
                    peer = %self.peer,
                    written,
                    len = line.len(),
                    "message cut short, shutting the connection down"
                );
                // the reader sees the end of the stream and releases the team
                let _ = stream.shutdown(Shutdown::Both);
                Err(anyhow!(e).context(format!("partial send to {}", self.peer)))
            }
        }
    }

    fn probe(&self, timeout: Duration) -> ProbeOutcome {
        let health_rx = self.health_rx.lock().expect("poisoned");
        // stale replies to an earlier probe
        while health_rx.try_recv().is_ok() {}

        if let Err(e) = self.send(&ServerMessage::Health) {
            debug!("probe of {} failed: {e:#}", self.peer);
            return ProbeOutcome::Gone;
        }
        match health_rx.recv_timeout(timeout) {
            Ok(()) => ProbeOutcome::Healthy,
            Err(RecvTimeoutError::Timeout) => ProbeOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => ProbeOutcome::Gone,
        }
    }

    fn close(&self, reason: &str) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&ServerMessage::Close {
            reason: reason.to_string(),
        })?;
        line.push(b'\n');
        let mut stream = self.writer.lock().expect("poisoned");
        let sent = write_before(&mut stream, &line, Instant::now() + WRITE_TIMEOUT)
            .map_err(|(_, e)| anyhow!(e).context(format!("close {}", self.peer)));
        stream.shutdown(Shutdown::Both)?;
        sent
    }
}

impl SessionReader {
    /// Next non-empty line, `None` once the client is gone. Lines that are not UTF-8 are
    /// logged and skipped.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if self.reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(None);
            }
            let line = match String::from_utf8(std::mem::take(&mut buf)) {
                Ok(line) => line,
                Err(e) => {
                    warn!("dropping line: {e}");
                    continue;
                }
            };
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Next message that is not a health reply. Lines outside the protocol are logged and
    /// dropped.
    pub fn next_message(&mut self) -> io::Result<Option<ClientMessage>> {
        while let Some(line) = self.next_line()? {
            match ClientMessage::parse(&line) {
                Ok(ClientMessage::Health) => {
                    // nobody waiting if the probe already timed out
                    let _ = self.health_tx.send(());
                }
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!("dropping line: {e}"),
            }
        }
        Ok(None)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)
    }
}

/// Runs one session until the client leaves or the connection is closed by the server.
#[instrument(skip_all, fields(peer = tracing::field::Empty))]
pub fn handle_session(stream: TcpStream, controller: &MatchController) -> anyhow::Result<()> {
    let (connection, mut reader) = TcpConnection::new(stream)?;
    tracing::Span::current().record("peer", tracing::field::display(connection.peer()));

    reader.set_read_timeout(Some(HELLO_TIMEOUT))?;
    let hello = match reader.next_line() {
        Ok(Some(line)) => serde_json::from_str::<Hello>(&line),
        Ok(None) => return Ok(()),
        Err(e) => {
            let _ = connection.close("no hello received");
            return Err(e.into());
        }
    };
    let team = match hello {
        Ok(Hello { team }) => team,
        Err(e) => {
            warn!("bad hello: {e}");
            let _ = connection.close(&format!("expected {{\"team\": <name>}}: {e}"));
            return Ok(());
        }
    };
    reader.set_read_timeout(None)?;

    let registry = controller.registry();
    let Ok(id) = registry.register(&team, connection.clone()) else {
        return Ok(());
    };
    controller.on_team_connected(&team);

    let outcome = loop {
        match reader.next_message() {
            Ok(Some(message)) => {
                trace!(%team, ?message);
                controller.handle_message(&team, message);
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    registry.release(&team, id);
    outcome.with_context(|| format!("session of {team}"))
}

/// Accepts sessions on `listener` until it fails, one thread per session.
pub fn serve(listener: TcpListener, controller: MatchController) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let controller = controller.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_session(stream, &controller) {
                        debug!("session ended: {e:#}");
                    }
                });
            }
            Err(e) => error!("accept failed: {e}"),
        }
    }
}

/// Binds `addr` and serves sessions from a background thread.
///
/// Returns the bound address, useful when binding port 0.
pub fn spawn_session_listener(
    addr: impl ToSocketAddrs,
    controller: MatchController,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    info!(%local, "listening for teams");
    let handle = thread::spawn(move || serve(listener, controller));
    Ok((local, handle))
}
