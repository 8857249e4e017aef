use std::io::Write;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, trace, warn};

use crate::client::WsStream;
use crate::controller::RunContext;
use crate::counter::ByteCounter;
use crate::errors::{DialError, ErrorCategory};
use crate::metrics::{
    ACTIVE_CONNECTIONS, BYTES_RECEIVED_TOTAL, CONNECTIONS_TOTAL, DIAL_ERRORS_TOTAL,
    MESSAGES_RECEIVED_TOTAL,
};

/// How a connection worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The run was stopping before the connection was established.
    NotStarted,
    /// Dialing failed; the worker published nothing.
    DialFailed,
    /// The peer sent a close frame or the stream ended.
    RemoteClosed,
    /// Reading the next message failed.
    ReadFailed,
    /// A stop signal or cancellation ended the receive loop.
    Stopped,
}

/// Write half of a live connection, published so stop can close it.
#[derive(Clone)]
pub struct ConnectionHandle {
    index: usize,
    sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
}

impl ConnectionHandle {
    fn new(index: usize, sink: SplitSink<WsStream, Message>) -> Self {
        Self {
            index,
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Index of the worker that owns this connection.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Sends `payload` as a single binary message.
    pub async fn send_binary(&self, payload: &[u8]) -> Result<(), tungstenite::Error> {
        self.sink
            .lock()
            .await
            .send(Message::binary(payload.to_vec()))
            .await
    }

    /// Sends a normal-closure close frame.
    pub async fn close(&self) -> Result<(), tungstenite::Error> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
    }
}

/// Runs one connection from dial to close.
///
/// Nothing that happens here affects other workers: every failure is logged
/// and ends only this worker.
pub async fn run_connection_worker(ctx: Arc<RunContext>, index: usize) -> WorkerOutcome {
    if ctx.is_stopping() {
        trace!(index, "Run already stopping, worker not started");
        return WorkerOutcome::NotStarted;
    }

    let dialed = tokio::select! {
        _ = ctx.cancelled() => Err(DialError::Cancelled),
        result = ctx.dialer().dial() => result,
    };

    let ws = match dialed {
        Ok((ws, response)) => {
            debug!(index, status = %response.status(), "websocket connected");
            ws
        }
        Err(DialError::Cancelled) => {
            debug!(index, "Dial abandoned, run is stopping");
            return WorkerOutcome::NotStarted;
        }
        Err(e) => {
            log_dial_error(index, &e);
            ctx.record_dial_failure();
            return WorkerOutcome::DialFailed;
        }
    };

    ctx.record_connected();
    CONNECTIONS_TOTAL.inc();
    ACTIVE_CONNECTIONS.inc();
    let outcome = drive_connection(&ctx, index, ws).await;
    ACTIVE_CONNECTIONS.dec();

    trace!(index, outcome = ?outcome, "Worker finished");
    outcome
}

fn log_dial_error(index: usize, error: &DialError) {
    let category = ErrorCategory::from_dial_error(error);
    DIAL_ERRORS_TOTAL
        .with_label_values(&[category.label()])
        .inc();

    error!(
        index,
        error = %error,
        error_category = category.label(),
        error_kind = %category,
        "Fatal error dialing websocket"
    );

    if let DialError::UpgradeRejected {
        status,
        headers,
        body,
    } = error
    {
        error!(
            index,
            status = %status,
            headers = ?headers,
            body = %body,
            "Upgrade rejected by server"
        );
    }
}

async fn drive_connection(ctx: &RunContext, index: usize, ws: WsStream) -> WorkerOutcome {
    let (sink, mut stream) = ws.split();
    let handle = ConnectionHandle::new(index, sink);

    if let Err(handle) = ctx.publish_connection(handle.clone()) {
        debug!(index, "Connection queue closed, closing websocket");
        if let Err(e) = handle.close().await {
            debug!(index, error = %e, "write close");
        }
        return WorkerOutcome::Stopped;
    }

    if let Some(payload) = ctx.config().payload.as_deref() {
        if let Err(e) = handle.send_binary(payload).await {
            warn!(index, error = %e, "Error writing to websocket");
        }
    }

    let counter = Arc::new(ByteCounter::new());
    if !ctx.publish_counter(Arc::clone(&counter)) {
        debug!(index, "Counter queue closed, bytes from this connection will not be reported");
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!(index, "Stop observed while waiting for data");
                return WorkerOutcome::Stopped;
            }
            next = stream.next() => next,
        };

        match next {
            None => {
                debug!(index, "websocket stream ended");
                return WorkerOutcome::RemoteClosed;
            }
            Some(Err(e)) => {
                debug!(index, error = %e, "error reading from websocket");
                return WorkerOutcome::ReadFailed;
            }
            Some(Ok(Message::Close(frame))) => {
                MESSAGES_RECEIVED_TOTAL.with_label_values(&["close"]).inc();
                debug!(index, frame = ?frame, "websocket closed by peer");
                return WorkerOutcome::RemoteClosed;
            }
            Some(Ok(message)) => {
                if ctx.config().very_verbose() {
                    let mut stdout = std::io::stdout().lock();
                    record_message(index, &counter, &message, Some(&mut stdout));
                } else {
                    record_message(index, &counter, &message, None::<&mut std::io::Stdout>);
                }
            }
        }

        if ctx.take_stop_signal() {
            debug!(index, "Stop signal received");
            return WorkerOutcome::Stopped;
        }
    }
}

/// Counts a text or binary message and echoes its bytes to `echo` when given.
/// Returns the number of bytes counted.
fn record_message<W: Write>(
    index: usize,
    counter: &ByteCounter,
    message: &Message,
    echo: Option<&mut W>,
) -> usize {
    let (kind, data): (&'static str, &[u8]) = match message {
        Message::Text(text) => ("text", text.as_bytes()),
        Message::Binary(data) => ("binary", &data[..]),
        Message::Ping(_) => {
            MESSAGES_RECEIVED_TOTAL.with_label_values(&["ping"]).inc();
            trace!(index, "ping");
            return 0;
        }
        Message::Pong(_) => {
            MESSAGES_RECEIVED_TOTAL.with_label_values(&["pong"]).inc();
            trace!(index, "pong");
            return 0;
        }
        Message::Close(_) | Message::Frame(_) => return 0,
    };

    if let Some(out) = echo {
        if let Err(e) = out.write_all(data).and_then(|_| out.flush()) {
            trace!(index, error = %e, "Failed to echo message to stdout");
        }
    }

    let n = counter.record(data);
    BYTES_RECEIVED_TOTAL.inc_by(n as u64);
    MESSAGES_RECEIVED_TOTAL.with_label_values(&[kind]).inc();
    debug!(index, bytes = n, kind, "read bytes from websocket");
    n
}
