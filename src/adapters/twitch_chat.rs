//! Thin IRC-over-WebSocket transport for the streaming chat. Speaks just
//! enough of the line protocol to log in, keep the connection alive, and
//! move JOIN/PART/PRIVMSG lines in both directions; everything above the
//! line level lives in the adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::ChatHandle;
use crate::channel::ChannelName;

const CHAT_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// One chat message as seen by the command router.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel: ChannelName,
    pub username: String,
    pub text: String,
    pub is_moderator: bool,
}

enum Outbound {
    Line(String),
}

/// Sender half of the chat connection. Cloneable; implements
/// [`ChatHandle`] for the orchestrator.
#[derive(Clone)]
pub struct TwitchChatClient {
    tx: mpsc::Sender<Outbound>,
}

impl TwitchChatClient {
    async fn send_line(&self, line: String) -> anyhow::Result<()> {
        self.tx
            .send(Outbound::Line(line))
            .await
            .map_err(|_| anyhow::anyhow!("chat connection is gone"))
    }
}

#[async_trait]
impl ChatHandle for TwitchChatClient {
    async fn join(&self, channel: &ChannelName) -> anyhow::Result<()> {
        self.send_line(format!("JOIN {channel}")).await
    }

    async fn part(&self, channel: &ChannelName) -> anyhow::Result<()> {
        self.send_line(format!("PART {channel}")).await
    }

    async fn say(&self, channel: &ChannelName, message: &str) -> anyhow::Result<()> {
        self.send_line(format!("PRIVMSG {channel} :{message}")).await
    }

    async fn whisper(&self, username: &str, message: &str) -> anyhow::Result<()> {
        // Whispers ride on the jtv pseudo-channel, the way chat libraries
        // send them.
        self.send_line(format!("PRIVMSG #jtv :/w {username} {message}"))
            .await
    }
}

/// Connect and log in, returning the sender handle and the inbound
/// message stream. The connection task runs until either side closes.
pub async fn connect(
    username: &str,
    token: &str,
) -> anyhow::Result<(TwitchChatClient, mpsc::Receiver<ChatMessage>)> {
    let (ws, _) = connect_async(CHAT_WS_URL).await?;
    let (mut sink, mut stream) = ws.split();

    let pass = if token.starts_with("oauth:") {
        token.to_string()
    } else {
        format!("oauth:{token}")
    };
    sink.send(Message::text(format!("PASS {pass}"))).await?;
    sink.send(Message::text(format!("NICK {}", username.to_lowercase())))
        .await?;
    sink.send(Message::text(
        "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
    ))
    .await?;
    info!(username, "Chat connection established");

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let (msg_tx, msg_rx) = mpsc::channel::<ChatMessage>(INBOUND_BUFFER);
    let own_login = username.to_lowercase();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    let Some(Outbound::Line(line)) = command else {
                        debug!("Chat sender dropped, closing connection");
                        break;
                    };
                    if let Err(err) = sink.send(Message::text(line)).await {
                        error!(error = %err, "Chat send failed");
                        break;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            for line in text.as_str().lines() {
                                if let Some(pong) = ping_reply(line) {
                                    if let Err(err) = sink.send(Message::text(pong)).await {
                                        error!(error = %err, "Chat pong failed");
                                    }
                                    continue;
                                }
                                if let Some(message) = parse_privmsg(line) {
                                    // The bot's own messages are not commands.
                                    if message.username == own_login {
                                        continue;
                                    }
                                    if msg_tx.send(message).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(err) = sink.send(Message::Pong(data)).await {
                                error!(error = %err, "Chat pong failed");
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Chat connection closed by the server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            error!(error = %err, "Chat connection error");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok((TwitchChatClient { tx: cmd_tx }, msg_rx))
}

fn ping_reply(line: &str) -> Option<String> {
    line.strip_prefix("PING")
        .map(|rest| format!("PONG{rest}"))
}

/// Parse one `PRIVMSG` line, with or without a leading tags section.
/// Anything else comes back as `None`.
fn parse_privmsg(line: &str) -> Option<ChatMessage> {
    let (tags, rest) = match line.strip_prefix('@') {
        Some(tagged) => {
            let (tags, rest) = tagged.split_once(' ')?;
            (Some(tags), rest)
        }
        None => (None, line),
    };

    let rest = rest.strip_prefix(':')?;
    let (source, rest) = rest.split_once(' ')?;
    let rest = rest.strip_prefix("PRIVMSG ")?;
    let (channel, text) = rest.split_once(" :")?;
    let username = source.split('!').next()?.to_lowercase();

    let tag_map: HashMap<&str, &str> = tags
        .map(|tags| {
            tags.split(';')
                .filter_map(|pair| pair.split_once('='))
                .collect()
        })
        .unwrap_or_default();
    let is_moderator = tag_map.get("mod").copied() == Some("1")
        || tag_map
            .get("badges")
            .is_some_and(|badges| badges.contains("moderator/"));

    Some(ChatMessage {
        channel: ChannelName::new(channel),
        username,
        text: text.to_string(),
        is_moderator,
    })
}
