//! Thin gateway shim for the messaging platform: identify, heartbeat, and
//! the three dispatch events the bridge cares about. Reconnects with a
//! fixed delay; anything smarter (resume, sharding) is out of scope for a
//! single-guild-scale bot.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 256;

/// Guild messages, guild lifecycle, and message content.
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

/// The gateway events the bridge consumes.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    MessageCreate {
        guild_id: String,
        channel_id: String,
        author_id: String,
        author_is_bot: bool,
        content: String,
        member_roles: Vec<String>,
        mention_roles: Vec<String>,
    },
    GuildCreate {
        guild_id: String,
    },
    /// The bot was removed from a guild (as opposed to the guild going
    /// temporarily unavailable).
    GuildDelete {
        guild_id: String,
    },
}

#[derive(Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// Spawn the gateway connection task. Events arrive on the returned
/// channel; the task reconnects on its own until the receiver is dropped.
pub fn spawn(token: String) -> mpsc::Receiver<GatewayEvent> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(async move {
        loop {
            match run_connection(&token, &tx).await {
                Ok(()) => info!("Gateway connection ended"),
                Err(err) => error!(error = %err, "Gateway connection failed"),
            }
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
            info!("Reconnecting to the gateway");
        }
    });
    rx
}

async fn run_connection(token: &str, tx: &mpsc::Sender<GatewayEvent>) -> anyhow::Result<()> {
    let (ws, _) = connect_async(GATEWAY_URL).await?;
    let (mut sink, mut stream) = ws.split();

    // The server speaks first with Hello carrying the heartbeat interval.
    let hello = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let payload: GatewayPayload = serde_json::from_str(text.as_str())?;
                if payload.op == 10 {
                    break payload;
                }
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
            None => anyhow::bail!("gateway closed before Hello"),
        }
    };
    let heartbeat_ms = hello.d["heartbeat_interval"].as_u64().unwrap_or(41_250);

    let identify = json!({
        "op": 2,
        "d": {
            "token": token,
            "intents": INTENTS,
            "properties": { "os": "linux", "browser": "usher", "device": "usher" },
        }
    });
    sink.send(Message::text(identify.to_string())).await?;
    info!("Gateway identify sent");

    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seq: Option<u64> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let beat = json!({ "op": 1, "d": last_seq });
                sink.send(Message::text(beat.to_string())).await?;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                            Ok(payload) => payload,
                            Err(err) => {
                                warn!(error = %err, "Unparseable gateway payload");
                                continue;
                            }
                        };
                        if let Some(seq) = payload.s {
                            last_seq = Some(seq);
                        }
                        match payload.op {
                            0 => {
                                if let Some(event) =
                                    parse_dispatch(payload.t.as_deref(), &payload.d)
                                {
                                    if tx.send(event).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                            1 => {
                                let beat = json!({ "op": 1, "d": last_seq });
                                sink.send(Message::text(beat.to_string())).await?;
                            }
                            7 | 9 => {
                                // Reconnect request / invalid session: drop
                                // the connection and start over.
                                anyhow::bail!("gateway asked for a reconnect (op {})", payload.op);
                            }
                            11 => debug!("Heartbeat acknowledged"),
                            other => debug!(op = other, "Ignoring gateway op"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        anyhow::bail!("gateway closed: {frame:?}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                }
            }
        }
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Translate a dispatch payload into a [`GatewayEvent`], if it is one of
/// the three the bridge handles.
fn parse_dispatch(kind: Option<&str>, d: &Value) -> Option<GatewayEvent> {
    match kind? {
        "MESSAGE_CREATE" => {
            // Direct messages carry no guild id and are not command
            // surfaces here.
            let guild_id = d["guild_id"].as_str()?.to_string();
            Some(GatewayEvent::MessageCreate {
                guild_id,
                channel_id: d["channel_id"].as_str()?.to_string(),
                author_id: d["author"]["id"].as_str()?.to_string(),
                author_is_bot: d["author"]["bot"].as_bool().unwrap_or(false),
                content: d["content"].as_str().unwrap_or_default().to_string(),
                member_roles: string_list(&d["member"]["roles"]),
                mention_roles: string_list(&d["mention_roles"]),
            })
        }
        "GUILD_CREATE" => Some(GatewayEvent::GuildCreate {
            guild_id: d["id"].as_str()?.to_string(),
        }),
        "GUILD_DELETE" => {
            // `unavailable: true` is an outage, not a removal.
            if d["unavailable"].as_bool().unwrap_or(false) {
                return None;
            }
            Some(GatewayEvent::GuildDelete {
                guild_id: d["id"].as_str()?.to_string(),
            })
        }
        _ => None,
    }
}
