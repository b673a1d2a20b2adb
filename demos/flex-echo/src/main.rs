//! flex-echo: echo server and client over flexmux on TCP.
//!
//! ```bash
//! RUST_LOG=info,flexmux_core=debug flex-echo server --listen 127.0.0.1:7070
//! flex-echo client --connect 127.0.0.1:7070 --streams 4 --message hello
//! ```
//!
//! The server echoes each remote stream's control and data frames back on the
//! same stream and ends the stream when the client ends it. The client opens
//! the streams, sends one message on each, waits for the echoes, pings, and
//! disconnects.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use flexmux_core::transport::stream;
use flexmux_core::{
    DisconnectionFrame, FlexCodec, FrameCodec, MessageFrame, PingFrame, Role, SessionBuilder,
    SessionConfig, SessionHandle, SessionListener, Stream, StreamListener,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "flex-echo")]
#[command(about = "Echo server and client for flexmux")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every stream.
    Server {
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: String,
    },
    /// Open streams against a server and print the echoes.
    Client {
        #[arg(long, default_value = "127.0.0.1:7070")]
        connect: String,
        /// Number of streams to open.
        #[arg(long, default_value_t = 4)]
        streams: usize,
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        match args.command {
            Command::Server { listen } => run_server(&listen).await,
            Command::Client {
                connect,
                streams,
                message,
            } => run_client(&connect, streams, &message).await,
        }
    })
}

fn codec() -> Arc<dyn FrameCodec> {
    Arc::new(FlexCodec::new())
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct Echo;

impl StreamListener for Echo {
    fn on_control(&self, stream: &Arc<Stream>, frame: &MessageFrame) {
        drop(stream.send_control(frame.payload.clone(), frame.end_stream));
    }

    fn on_data(&self, stream: &Arc<Stream>, frame: &MessageFrame) {
        tracing::debug!(stream_id = stream.id(), len = frame.payload.len(), "echo");
        drop(stream.send_data(frame.payload.clone(), frame.end_stream));
    }
}

struct EchoServer;

impl SessionListener for EchoServer {
    fn on_new_stream(&self, stream: &Arc<Stream>, frame: &MessageFrame) -> Arc<dyn StreamListener> {
        tracing::info!(stream_id = stream.id(), "stream opened");
        drop(stream.send_control(frame.payload.clone(), frame.end_stream));
        Arc::new(Echo)
    }

    fn on_disconnect(&self, session: &dyn SessionHandle, frame: &DisconnectionFrame) {
        tracing::info!(
            session_id = session.session_id(),
            reason = %String::from_utf8_lossy(&frame.reason),
            "client disconnected"
        );
    }
}

async fn run_server(listen: &str) -> Result<(), Error> {
    let listener = TcpListener::bind(listen).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let (tx, rx) = stream::split(socket, codec());
        let session = SessionBuilder::new(SessionConfig::from_env(Role::Server))
            .listener(Arc::new(EchoServer))
            .span(tracing::info_span!("connection", %peer))
            .build(tx);
        tokio::spawn(async move {
            match session.clone().run(rx).await {
                Ok(()) => tracing::info!(%peer, "connection finished"),
                Err(e) => tracing::warn!(%peer, error = %e, "connection failed"),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Forwards echoed frames to the client task.
struct Collector {
    tx: mpsc::UnboundedSender<(u32, Bytes, bool)>,
}

impl StreamListener for Collector {
    fn on_control(&self, stream: &Arc<Stream>, frame: &MessageFrame) {
        let _ = self.tx.send((stream.id(), frame.payload.clone(), false));
    }

    fn on_data(&self, stream: &Arc<Stream>, frame: &MessageFrame) {
        let _ = self.tx.send((stream.id(), frame.payload.clone(), frame.end_stream));
    }
}

struct ClientEvents {
    pong: Notify,
}

impl SessionListener for ClientEvents {
    fn on_new_stream(&self, stream: &Arc<Stream>, _frame: &MessageFrame) -> Arc<dyn StreamListener> {
        tracing::warn!(stream_id = stream.id(), "server opened an unexpected stream");
        Arc::new(Echo)
    }

    fn on_ping(&self, _session: &dyn SessionHandle, _frame: &PingFrame) {
        self.pong.notify_one();
    }
}

async fn run_client(connect: &str, streams: usize, message: &str) -> Result<(), Error> {
    let socket = TcpStream::connect(connect).await?;
    socket.set_nodelay(true)?;
    let (tx, rx) = stream::split(socket, codec());

    let events = Arc::new(ClientEvents { pong: Notify::new() });
    let session = SessionBuilder::new(SessionConfig::from_env(Role::Client))
        .listener(events.clone())
        .build(tx);
    let reader = tokio::spawn(session.clone().run(rx));

    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
    let collector: Arc<dyn StreamListener> = Arc::new(Collector { tx: echo_tx });

    let opened = futures::future::try_join_all((0..streams).map(|n| {
        session.new_stream(MessageFrame::new(0, format!("stream {n}")), collector.clone())
    }))
    .await?;
    let sends = opened
        .iter()
        .map(|s| s.send_data(format!("{message} from {}", s.id()), true));
    futures::future::try_join_all(sends).await?;

    let mut finished = 0;
    while finished < streams {
        let Some((stream_id, payload, end_stream)) =
            tokio::time::timeout(REPLY_TIMEOUT, echo_rx.recv()).await?
        else {
            break;
        };
        println!("[{stream_id}] {}", String::from_utf8_lossy(&payload));
        if end_stream {
            finished += 1;
        }
    }
    tracing::info!(finished, open = session.stream_count(), "echoes received");

    let pong = events.pong.notified();
    session.ping().await?;
    tokio::time::timeout(REPLY_TIMEOUT, pong).await?;
    println!("ping ok");

    session.disconnect(DisconnectionFrame::new("bye")).await?;
    reader.await??;
    Ok(())
}
