//! Socket client: connect, classify, buffer, flush, publish, reconnect.
//!
//! One thread owns the connection and all buffering state. The transport is
//! polled with a short read timeout so the loop doubles as the periodic tick
//! that drives idle-flush deadlines, outcome dispatch, and shutdown checks.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, info, warn};
use tungstenite::client::client;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use crate::buffer::{speaker_key, SpeakerBuffers};
use crate::config::AppConfig;
use crate::errors::{ClientError, SessionError};
use crate::wire::{classify, comment_frame, InboundEvent};
use crate::worker::{ExchangeOutcome, ExchangeRequest};
use crate::ShutdownToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Socket read timeout; doubles as the loop tick period.
const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Granularity of the interruptible backoff sleep.
const BACKOFF_SLICE: Duration = Duration::from_millis(100);
/// Bound on waiting for in-flight outcomes during the shutdown drain.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Exponential reconnect backoff: each failure doubles the delay up to the
/// cap; a successful connection resets it.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial = Duration::from_millis(initial_ms);
        Self {
            initial,
            max: Duration::from_millis(max_ms),
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why one connection's serve loop ended.
enum SessionEnd {
    /// Server closed cleanly; reconnect with a fresh backoff.
    Clean,
    /// Shutdown requested; drained and done.
    Shutdown,
}

/// One polled step of the inbound transport.
pub enum Inbound {
    Text(String),
    /// Read timeout; nothing arrived this tick.
    Tick,
    Closed,
}

/// Seam between the serve loop and the socket, so the loop is testable
/// against scripted transports.
pub trait Transport {
    fn poll(&mut self) -> Result<Inbound, ClientError>;
    fn send_text(&mut self, text: &str) -> Result<(), ClientError>;
    fn close(&mut self);
}

struct WsTransport {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl Transport for WsTransport {
    fn poll(&mut self) -> Result<Inbound, ClientError> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Inbound::Text(text.to_string())),
            Ok(Message::Close(_)) => Ok(Inbound::Closed),
            Ok(_) => Ok(Inbound::Tick),
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(Inbound::Tick)
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(Inbound::Closed)
            }
            Err(err) => Err(ClientError::Connection(err.to_string())),
        }
    }

    fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.socket
            .send(Message::text(text))
            .map_err(|err| ClientError::Dispatch(err.to_string()))
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

fn connect(url: &str) -> Result<WsTransport, ClientError> {
    let parsed = Url::parse(url).map_err(|err| ClientError::Connection(err.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ClientError::Connection(format!("no host in {url}")))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| ClientError::Connection(format!("no port in {url}")))?;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|err| ClientError::Connection(err.to_string()))?
        .next()
        .ok_or_else(|| ClientError::Connection(format!("{host}:{port} did not resolve")))?;

    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|err| ClientError::Connection(err.to_string()))?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|err| ClientError::Connection(err.to_string()))?;
    stream
        .set_nodelay(true)
        .map_err(|err| ClientError::Connection(err.to_string()))?;

    let (socket, _response) = client(parsed.as_str(), MaybeTlsStream::Plain(stream))
        .map_err(|err| ClientError::Connection(err.to_string()))?;
    Ok(WsTransport { socket })
}

/// Serve one connection until it drops or shutdown is requested.
///
/// `in_flight` counts generation requests enqueued but not yet answered;
/// it outlives a single connection because outcomes for requests queued on
/// one connection may surface on the next.
fn serve<T: Transport>(
    transport: &mut T,
    config: &AppConfig,
    shutdown: &ShutdownToken,
    in_flight: &mut usize,
    requests: &Sender<ExchangeRequest>,
    outcomes: &Receiver<ExchangeOutcome>,
) -> Result<SessionEnd, ClientError> {
    let mut buffers = SpeakerBuffers::new(
        config.lines_per_batch,
        Duration::from_secs(config.idle_flush_secs),
    );

    let result = serve_connection(
        transport, config, shutdown, &mut buffers, in_flight, requests, outcomes,
    );
    if !matches!(result.as_ref(), Ok(SessionEnd::Shutdown)) {
        // The connection ended with lines still buffered; queue them so
        // they publish on the next connection instead of vanishing.
        for (key, text) in buffers.drain_all() {
            debug!(speaker = %key, "requeueing unflushed lines");
            if enqueue(requests, text, key) {
                *in_flight += 1;
            }
        }
    }
    result
}

fn serve_connection<T: Transport>(
    transport: &mut T,
    config: &AppConfig,
    shutdown: &ShutdownToken,
    buffers: &mut SpeakerBuffers,
    in_flight: &mut usize,
    requests: &Sender<ExchangeRequest>,
    outcomes: &Receiver<ExchangeOutcome>,
) -> Result<SessionEnd, ClientError> {
    loop {
        if shutdown.should_stop() {
            drain(
                transport, config, shutdown, buffers, in_flight, requests, outcomes,
            )?;
            return Ok(SessionEnd::Shutdown);
        }

        // Finished generations are published as soon as they surface.
        loop {
            match outcomes.try_recv() {
                Ok(outcome) => {
                    *in_flight = in_flight.saturating_sub(1);
                    dispatch_outcome(transport, config, shutdown, outcome)?;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(ClientError::Connection(
                        "comment worker is gone".to_string(),
                    ))
                }
            }
        }

        let now = Instant::now();
        for key in buffers.due_keys(now) {
            if let Some(text) = buffers.take(&key) {
                debug!(speaker = %key, "idle flush");
                if enqueue(requests, text, key) {
                    *in_flight += 1;
                }
            }
        }

        match transport.poll()? {
            Inbound::Tick => continue,
            Inbound::Closed => {
                info!("server closed the connection");
                return Ok(SessionEnd::Clean);
            }
            Inbound::Text(raw) => match classify(&raw) {
                Err(err) => {
                    warn!(%err, "dropping malformed message");
                }
                Ok(InboundEvent::Ignored) => {}
                Ok(InboundEvent::Comment { text, speaker }) => {
                    let key = speaker_key(speaker.as_deref());
                    info!(speaker = %key, "chat comment received");
                    if enqueue(requests, text, key) {
                        *in_flight += 1;
                    }
                }
                Ok(InboundEvent::Subtitle { text, speaker }) => {
                    let key = speaker_key(speaker.as_deref());
                    if buffers.push(&key, &text, Instant::now()) {
                        if let Some(batch) = buffers.take(&key) {
                            debug!(speaker = %key, "threshold flush");
                            if enqueue(requests, batch, key) {
                                *in_flight += 1;
                            }
                        }
                    }
                }
            },
        }
    }
}

/// Enqueue a generation request without blocking; a full queue means the
/// session is saturated and this cycle is skipped. Returns whether the
/// request was actually queued.
fn enqueue(requests: &Sender<ExchangeRequest>, text: String, speaker: String) -> bool {
    match requests.try_send(ExchangeRequest::Generate { text, speaker }) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("generation queue full, skipping this batch");
            false
        }
        Err(TrySendError::Disconnected(_)) => {
            warn!("comment worker is gone, dropping batch");
            false
        }
    }
}

/// Publish one finished generation. Failures and empty comments are
/// replaced with the fallback comment; cancellation propagates.
fn dispatch_outcome<T: Transport>(
    transport: &mut T,
    config: &AppConfig,
    shutdown: &ShutdownToken,
    outcome: ExchangeOutcome,
) -> Result<(), ClientError> {
    let comment = match outcome.result {
        Ok(comment) if !comment.is_empty() => comment,
        Ok(_) => {
            debug!("empty comment, substituting fallback");
            config.fallback_comment.clone()
        }
        Err(SessionError::Cancelled) => {
            if shutdown.should_abort() {
                return Err(ClientError::Cancelled);
            }
            config.fallback_comment.clone()
        }
        Err(err) => {
            warn!(%err, "generation failed, substituting fallback");
            config.fallback_comment.clone()
        }
    };

    let frame = comment_frame(&comment, &config.speaker_name);
    let json = serde_json::to_string(&frame)
        .map_err(|err| ClientError::Dispatch(err.to_string()))?;
    info!(comment = %comment, "publishing comment");
    transport.send_text(&json)
}

/// Shutdown drain: flush every pending buffer, wait (bounded) for every
/// outstanding outcome — including exchanges already in flight before
/// shutdown — publish best-effort, then close the transport.
fn drain<T: Transport>(
    transport: &mut T,
    config: &AppConfig,
    shutdown: &ShutdownToken,
    buffers: &mut SpeakerBuffers,
    in_flight: &mut usize,
    requests: &Sender<ExchangeRequest>,
    outcomes: &Receiver<ExchangeOutcome>,
) -> Result<(), ClientError> {
    for (key, text) in buffers.drain_all() {
        debug!(speaker = %key, "shutdown flush");
        if enqueue(requests, text, key) {
            *in_flight += 1;
        }
    }
    info!(pending = *in_flight, "draining before shutdown");

    let deadline = Instant::now() + DRAIN_GRACE;
    while *in_flight > 0 && Instant::now() < deadline && !shutdown.should_abort() {
        match outcomes.recv_timeout(BACKOFF_SLICE) {
            Ok(outcome) => {
                *in_flight -= 1;
                match dispatch_outcome(transport, config, shutdown, outcome) {
                    Ok(()) => {}
                    Err(ClientError::Cancelled) => {
                        transport.close();
                        return Err(ClientError::Cancelled);
                    }
                    Err(err) => {
                        warn!(%err, "drain dispatch failed");
                        break;
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    if *in_flight > 0 {
        warn!(pending = *in_flight, "shutdown drain left batches unpublished");
    }

    transport.close();
    Ok(())
}

/// Outer connect/serve/reconnect loop. Returns when shutdown completes or
/// an exchange cancellation propagates.
pub fn run(
    config: &AppConfig,
    shutdown: &ShutdownToken,
    requests: &Sender<ExchangeRequest>,
    outcomes: &Receiver<ExchangeOutcome>,
) -> Result<(), ClientError> {
    let url = config.url();
    run_loop(config, shutdown, requests, outcomes, || {
        info!(%url, "connecting to overlay socket");
        connect(&url)
    })
}

/// The reconnect loop behind [`run`], generic over the connector so it is
/// testable with scripted transports. A clean session end reconnects
/// immediately with a fresh backoff; only failures sleep.
fn run_loop<T, C>(
    config: &AppConfig,
    shutdown: &ShutdownToken,
    requests: &Sender<ExchangeRequest>,
    outcomes: &Receiver<ExchangeOutcome>,
    mut connector: C,
) -> Result<(), ClientError>
where
    T: Transport,
    C: FnMut() -> Result<T, ClientError>,
{
    let mut backoff = Backoff::new(config.reconnect_initial_ms, config.reconnect_max_ms);
    let mut in_flight = 0usize;

    loop {
        if shutdown.should_stop() {
            return Ok(());
        }

        match connector() {
            Ok(mut transport) => {
                info!("connected");
                match serve(
                    &mut transport,
                    config,
                    shutdown,
                    &mut in_flight,
                    requests,
                    outcomes,
                ) {
                    Ok(SessionEnd::Shutdown) => return Ok(()),
                    Ok(SessionEnd::Clean) => {
                        backoff.reset();
                        continue;
                    }
                    Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                    Err(err) => {
                        warn!(%err, "connection lost");
                        transport.close();
                    }
                }
            }
            Err(err) => {
                warn!(%err, "connect failed");
            }
        }

        let delay = backoff.next();
        debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
        if !sleep_interruptible(delay, shutdown) {
            return Ok(());
        }
    }
}

/// Sleep in short slices so shutdown interrupts the backoff promptly.
/// Returns false when shutdown was requested mid-sleep.
fn sleep_interruptible(total: Duration, shutdown: &ShutdownToken) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if shutdown.should_stop() {
            return false;
        }
        thread::sleep(BACKOFF_SLICE.min(deadline - Instant::now()));
    }
    !shutdown.should_stop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use crossbeam_channel::bounded;
    use std::collections::VecDeque;

    fn test_config() -> AppConfig {
        AppConfig::try_parse_from(["wipecast", "--lines-per-batch", "2"])
            .expect("test arguments parse")
    }

    /// Scripted transport: plays back a fixed inbound sequence, records
    /// everything sent. Once the script runs out it either reports a clean
    /// close or a connection error.
    struct ScriptedTransport {
        script: VecDeque<Inbound>,
        sent: Vec<String>,
        closed: bool,
        fail_when_exhausted: bool,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Inbound>) -> Self {
            Self {
                script: script.into(),
                sent: Vec::new(),
                closed: false,
                fail_when_exhausted: false,
            }
        }

        fn failing(script: Vec<Inbound>) -> Self {
            Self {
                fail_when_exhausted: true,
                ..Self::new(script)
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn poll(&mut self) -> Result<Inbound, ClientError> {
            match self.script.pop_front() {
                Some(inbound) => Ok(inbound),
                None if self.fail_when_exhausted => {
                    Err(ClientError::Connection("scripted drop".to_string()))
                }
                None => Ok(Inbound::Closed),
            }
        }

        fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
            self.sent.push(text.to_string());
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn subtitle(text: &str, speaker: &str) -> Inbound {
        Inbound::Text(format!(
            r#"{{"jsonrpc":"2.0","params":{{"type":"subtitle","text":"{text}","speaker":"{speaker}"}}}}"#
        ))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(500, 5000);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 5000, 5000]);
        backoff.reset();
        assert_eq!(backoff.next().as_millis(), 500);
    }

    #[test]
    fn serve_flushes_on_threshold() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, request_rx) = bounded(8);
        let (_outcome_tx, outcome_rx) = bounded::<ExchangeOutcome>(8);

        let mut transport = ScriptedTransport::new(vec![
            subtitle("one", "a"),
            subtitle("two", "a"),
            Inbound::Closed,
        ]);
        let mut in_flight = 0;
        let end = serve(
            &mut transport,
            &config,
            &shutdown,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();
        assert!(matches!(end, SessionEnd::Clean));
        assert_eq!(in_flight, 1);

        match request_rx.try_recv().unwrap() {
            ExchangeRequest::Generate { text, speaker } => {
                assert_eq!(text, "one\ntwo");
                assert_eq!(speaker, "a");
            }
            other => panic!("unexpected request: {other:?}"),
        }
        assert!(request_rx.try_recv().is_err());
    }

    #[test]
    fn serve_publishes_finished_outcomes() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, _request_rx) = bounded(8);
        let (outcome_tx, outcome_rx) = bounded(8);
        outcome_tx
            .send(ExchangeOutcome {
                speaker: "a".to_string(),
                result: Ok("ナイス".to_string()),
            })
            .unwrap();

        let mut transport = ScriptedTransport::new(vec![Inbound::Tick, Inbound::Closed]);
        let mut in_flight = 1;
        serve(
            &mut transport,
            &config,
            &shutdown,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();

        assert_eq!(in_flight, 0);
        assert_eq!(transport.sent.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&transport.sent[0]).unwrap();
        assert_eq!(frame["params"]["text"], "ナイス");
        assert_eq!(frame["params"]["speaker"], "wipe");
    }

    #[test]
    fn failed_outcome_publishes_fallback() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, _request_rx) = bounded(8);
        let (outcome_tx, outcome_rx) = bounded(8);
        outcome_tx
            .send(ExchangeOutcome {
                speaker: String::new(),
                result: Err(SessionError::ResponseTimeout { timeout_secs: 60 }),
            })
            .unwrap();

        let mut transport = ScriptedTransport::new(vec![Inbound::Tick, Inbound::Closed]);
        let mut in_flight = 1;
        serve(
            &mut transport,
            &config,
            &shutdown,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();

        let frame: serde_json::Value = serde_json::from_str(&transport.sent[0]).unwrap();
        assert_eq!(frame["params"]["text"], "いいね！");
    }

    #[test]
    fn stop_request_ends_serve_with_shutdown() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, _request_rx) = bounded(8);
        let (_outcome_tx, outcome_rx) = bounded::<ExchangeOutcome>(8);

        shutdown.request_stop();
        let mut transport = ScriptedTransport::new(vec![Inbound::Tick]);
        let mut in_flight = 0;
        let end = serve(
            &mut transport,
            &config,
            &shutdown,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        );
        assert!(matches!(end.unwrap(), SessionEnd::Shutdown));
        assert!(transport.closed);
    }

    #[test]
    fn drain_publishes_buffered_batches() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, request_rx) = bounded(8);
        let (outcome_tx, outcome_rx) = bounded(8);

        let mut buffers = SpeakerBuffers::new(10, Duration::ZERO);
        let now = Instant::now();
        buffers.push("a", "hello", now);
        buffers.push("b", "world", now);

        let echo = std::thread::spawn(move || {
            for _ in 0..2 {
                if let Ok(ExchangeRequest::Generate { text, speaker }) = request_rx.recv() {
                    outcome_tx
                        .send(ExchangeOutcome {
                            speaker,
                            result: Ok(text),
                        })
                        .unwrap();
                }
            }
        });

        let mut transport = ScriptedTransport::new(vec![]);
        let mut in_flight = 0;
        drain(
            &mut transport,
            &config,
            &shutdown,
            &mut buffers,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();
        echo.join().unwrap();
        assert_eq!(in_flight, 0);

        assert!(transport.closed);
        assert_eq!(transport.sent.len(), 2);
        let texts: Vec<String> = transport
            .sent
            .iter()
            .map(|raw| {
                let value: serde_json::Value = serde_json::from_str(raw).unwrap();
                value["params"]["text"].as_str().unwrap().to_string()
            })
            .collect();
        assert!(texts.contains(&"hello".to_string()));
        assert!(texts.contains(&"world".to_string()));
    }

    #[test]
    fn malformed_json_is_dropped_not_fatal() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, request_rx) = bounded(8);
        let (_outcome_tx, outcome_rx) = bounded::<ExchangeOutcome>(8);

        let mut transport = ScriptedTransport::new(vec![
            Inbound::Text("not json".to_string()),
            Inbound::Closed,
        ]);
        let mut in_flight = 0;
        let end = serve(
            &mut transport,
            &config,
            &shutdown,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();
        assert!(matches!(end, SessionEnd::Clean));
        assert!(request_rx.try_recv().is_err());
    }

    #[test]
    fn chat_comment_bypasses_buffering() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, request_rx) = bounded(8);
        let (_outcome_tx, outcome_rx) = bounded::<ExchangeOutcome>(8);

        let raw = r#"{"type":"comment","text":"hi there","speaker":"viewer"}"#;
        let mut transport = ScriptedTransport::new(vec![
            Inbound::Text(raw.to_string()),
            Inbound::Closed,
        ]);
        let mut in_flight = 0;
        serve(
            &mut transport,
            &config,
            &shutdown,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();

        match request_rx.try_recv().unwrap() {
            ExchangeRequest::Generate { text, speaker } => {
                assert_eq!(text, "hi there");
                assert_eq!(speaker, "viewer");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn drain_waits_for_in_flight_exchange_outcome() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, request_rx) = bounded(8);
        let (outcome_tx, outcome_rx) = bounded(8);

        let mut buffers = SpeakerBuffers::new(10, Duration::ZERO);
        buffers.push("a", "hello", Instant::now());
        // One exchange was already running when shutdown began; its
        // outcome must not satisfy the wait for the drained buffer's own.
        let mut in_flight = 1usize;

        let echo = std::thread::spawn(move || {
            outcome_tx
                .send(ExchangeOutcome {
                    speaker: String::new(),
                    result: Ok("earlier".to_string()),
                })
                .unwrap();
            if let Ok(ExchangeRequest::Generate { text, speaker }) = request_rx.recv() {
                outcome_tx
                    .send(ExchangeOutcome {
                        speaker,
                        result: Ok(text),
                    })
                    .unwrap();
            }
        });

        let mut transport = ScriptedTransport::new(vec![]);
        drain(
            &mut transport,
            &config,
            &shutdown,
            &mut buffers,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();
        echo.join().unwrap();

        assert_eq!(in_flight, 0);
        assert!(transport.closed);
        let texts: Vec<String> = transport
            .sent
            .iter()
            .map(|raw| {
                let value: serde_json::Value = serde_json::from_str(raw).unwrap();
                value["params"]["text"].as_str().unwrap().to_string()
            })
            .collect();
        assert!(texts.contains(&"earlier".to_string()));
        assert!(texts.contains(&"hello".to_string()));
    }

    #[test]
    fn connection_end_requeues_accumulated_lines() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, request_rx) = bounded(8);
        let (_outcome_tx, outcome_rx) = bounded::<ExchangeOutcome>(8);

        // One line below the threshold, then the server goes away; the
        // line must survive into the request queue.
        let mut transport =
            ScriptedTransport::new(vec![subtitle("hello", "a"), Inbound::Closed]);
        let mut in_flight = 0;
        let end = serve(
            &mut transport,
            &config,
            &shutdown,
            &mut in_flight,
            &request_tx,
            &outcome_rx,
        )
        .unwrap();
        assert!(matches!(end, SessionEnd::Clean));
        assert_eq!(in_flight, 1);

        match request_rx.try_recv().unwrap() {
            ExchangeRequest::Generate { text, speaker } => {
                assert_eq!(text, "hello");
                assert_eq!(speaker, "a");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn clean_end_reconnects_immediately_and_resets_backoff() {
        let config = test_config();
        let shutdown = ShutdownToken::new();
        let (request_tx, _request_rx) = bounded(8);
        let (_outcome_tx, outcome_rx) = bounded::<ExchangeOutcome>(8);

        let stop = shutdown.clone();
        let mut times: Vec<Instant> = Vec::new();
        let result = run_loop(&config, &shutdown, &request_tx, &outcome_rx, || {
            times.push(Instant::now());
            match times.len() {
                // Clean close, then an erroring connection, then end the run.
                1 => Ok(ScriptedTransport::new(vec![])),
                2 => Ok(ScriptedTransport::failing(vec![])),
                _ => {
                    stop.request_stop();
                    Err(ClientError::Connection("done".to_string()))
                }
            }
        });
        assert!(result.is_ok());
        assert_eq!(times.len(), 3);

        let after_clean = times[1] - times[0];
        assert!(
            after_clean < Duration::from_millis(250),
            "clean end should reconnect without backoff, waited {after_clean:?}"
        );
        let after_failure = times[2] - times[1];
        assert!(
            after_failure >= Duration::from_millis(400)
                && after_failure < Duration::from_millis(900),
            "first failure after a clean session should back off ~500ms, waited {after_failure:?}"
        );
    }

    #[test]
    fn sleep_interruptible_stops_early() {
        let shutdown = ShutdownToken::new();
        shutdown.request_stop();
        let started = Instant::now();
        assert!(!sleep_interruptible(Duration::from_secs(5), &shutdown));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
