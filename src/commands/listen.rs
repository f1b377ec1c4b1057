//! `pushrelay listen`: a small push client for poking at a relay.
//!
//! Handshakes, registers the requested channels, then prints every
//! notification as it arrives and acknowledges it. Server keepalive pings
//! are answered automatically.

use anyhow::{bail, Context, Result};

use crate::push::protocol::{ClientMessage, ServerMessage, STATUS_OK};
use crate::ws::{self, PushEvent};

/// Options for [`run`].
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Relay push URL (`ws://`, `wss://`, `http://` or `https://`).
    pub url: String,
    /// UAID to resume, if any.
    pub uaid: Option<String>,
    /// Channels to register.
    pub channels: Vec<String>,
}

/// Listen until the relay closes the connection or Ctrl-C.
pub async fn run(options: ListenOptions) -> Result<()> {
    let (mut writer, mut reader) = ws::connect(&options.url).await?;

    writer.hello(options.uaid.as_deref(), &[]).await?;
    let uaid = match reader.expect_message(std::time::Duration::from_secs(10)).await? {
        ServerMessage::Hello { uaid, status } if status == STATUS_OK => uaid,
        other => bail!("unexpected handshake reply: {other:?}"),
    };
    println!("connected as {uaid}");

    for chid in &options.channels {
        writer.register(chid).await?;
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                writer.close().await.ok();
                return Ok(());
            }
            event = reader.next_event() => event,
        };

        let Some(event) = event else {
            println!("connection ended");
            return Ok(());
        };

        match event.context("read failed")? {
            PushEvent::Message(msg) => {
                if let Some(line) = describe(&msg) {
                    println!("{line}");
                }
                match msg {
                    ServerMessage::Notification { chid, version } => {
                        writer.ack(&chid, version).await?;
                    }
                    ServerMessage::Ping => writer.send(&ClientMessage::Pong).await?,
                    _ => {}
                }
            }
            PushEvent::Closed { code, reason } => {
                println!("closed by relay ({code}) {reason}");
                return Ok(());
            }
        }
    }
}

/// One output line per interesting message.
fn describe(msg: &ServerMessage) -> Option<String> {
    match msg {
        ServerMessage::Notification { chid, version } => Some(format!("{chid} -> {version}")),
        ServerMessage::Register { chid, status } if *status == STATUS_OK => {
            Some(format!("registered {chid}"))
        }
        ServerMessage::Register { chid, status } => Some(format!("register {chid} failed ({status})")),
        ServerMessage::Unregister { chid, .. } => Some(format!("unregistered {chid}")),
        ServerMessage::Hello { .. } | ServerMessage::Ping | ServerMessage::Pong => None,
    }
}
