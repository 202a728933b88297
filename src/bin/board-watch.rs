use std::time::Duration;

use clap::Parser;
use futures::{SinkExt, StreamExt};
use kanban_live::client::reconnect::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, ReconnectPolicy, Reconnector,
    Step, parse_jitter,
};
use kanban_live::client::{ClientError, online_announcement, ws_url};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Parser, Debug)]
#[command(name = "board-watch", about = "Follow a kanban board's realtime envelopes")]
struct Cli {
    #[arg(long, env = "KANBAN_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "KANBAN_BOARD")]
    board: Uuid,

    #[arg(long, env = "KANBAN_SESSION_TOKEN")]
    session_token: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BASE_DELAY_MS)]
    base_delay_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_DELAY_MS)]
    max_delay_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    #[arg(long, default_value_t = DEFAULT_JITTER, value_parser = parse_jitter)]
    jitter: f64,
}

impl Cli {
    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let token = cli.session_token.clone().ok_or(ClientError::MissingSessionToken)?;
    let url = ws_url(&cli.base_url, cli.board)?;

    tokio::select! {
        result = watch(&url, &token, cli.board, cli.policy()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("board-watch: interrupted");
            Ok(())
        }
    }
}

/// Drive the reconnect machine until it gives up.
async fn watch(url: &str, token: &str, board_id: Uuid, policy: ReconnectPolicy) -> Result<(), ClientError> {
    let mut machine = Reconnector::new(policy);
    let mut rng = rand::rng();
    let mut step = machine.start()?;
    let mut live: Option<Stream> = None;

    loop {
        step = match step {
            Step::Connect => match connect(url, token).await {
                Ok(stream) => {
                    info!(%board_id, "board-watch: connected");
                    live = Some(stream);
                    machine.connected()?
                }
                Err(e) => {
                    warn!(error = %e, "board-watch: connect failed");
                    machine.connect_failed(&mut rng)?
                }
            },
            Step::AnnouncePresence => {
                if let Some(mut stream) = live.take() {
                    match relay(&mut stream, board_id).await {
                        Ok(()) => info!("board-watch: server closed the connection"),
                        Err(e) => warn!(error = %e, "board-watch: connection lost"),
                    }
                }
                machine.disconnected(&mut rng)?
            }
            Step::Wait(delay) => {
                info!(state = %machine.state(), delay_ms = delay.as_millis(), "board-watch: waiting to reconnect");
                tokio::time::sleep(delay).await;
                machine.delay_elapsed()?
            }
            Step::GiveUp => {
                let attempts = machine.policy().max_attempts;
                error!(attempts, "board-watch: giving up");
                return Err(ClientError::GaveUp { attempts });
            }
        };
    }
}

async fn connect(url: &str, token: &str) -> Result<Stream, ClientError> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

/// Announce presence, then print every envelope as one JSON line until the
/// connection ends.
async fn relay(stream: &mut Stream, board_id: Uuid) -> Result<(), ClientError> {
    let hello = serde_json::to_string(&online_announcement(board_id))?;
    stream.send(Message::Text(hello.into())).await?;

    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => println!("{}", text.as_str()),
            Message::Close(_) => return Ok(()),
            _ => {}
        }
    }
    Ok(())
}
