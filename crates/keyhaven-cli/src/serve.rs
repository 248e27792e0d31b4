//! JSON-lines message channel on stdin/stdout.
//!
//! Each stdin line is one inbound message.  `REQUEST`s run on their own
//! task so a slow upstream call does not hold up the channel; everything
//! else is answered inline.  A single writer task owns stdout, so the chunks
//! of one request stay in order and lines never interleave.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use keyhaven_broker::{
    InboundMessage, MessageHandler, OutboundMessage, RequestBroker, ReqwestTransport,
    SessionGuard,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::commands::open_vault;
use crate::config::{Config, PASSWORD_ENV, password_from_env};

const OUTBOUND_CAPACITY: usize = 256;

pub async fn cmd_serve(config: &Config) -> Result<()> {
    let vault = open_vault(config).await?;
    if !vault.is_installed() {
        bail!("no vault found; run `keyhaven init` first");
    }

    let session = SessionGuard::new(Arc::clone(&vault));
    let listener = session.spawn_event_listener();

    match password_from_env() {
        Some(password) => {
            if !vault.unlock(&password).await.context("failed to unlock vault")? {
                bail!("incorrect password in {PASSWORD_ENV}");
            }
            session.record_activity().await?;
        }
        None => warn!("{PASSWORD_ENV} not set; serving with the vault locked"),
    }

    let transport = ReqwestTransport::new(&config.user_agent, config.connect_timeout())
        .context("failed to build HTTP client")?;
    let broker = Arc::new(RequestBroker::new(
        Arc::clone(&vault),
        session.clone(),
        Arc::new(transport),
    ));
    let handler = MessageHandler::new(broker, env!("CARGO_PKG_VERSION"));

    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_outbound(rx));

    info!(unlocked = vault.is_unlocked(), "serving on stdin/stdout");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = JoinSet::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<InboundMessage>(line) {
            Ok(message @ InboundMessage::Request { .. }) => {
                let handler = handler.clone();
                let tx = tx.clone();
                inflight.spawn(async move { handler.handle(message, &tx).await });
            }
            Ok(message) => handler.handle(message, &tx).await,
            Err(_) => handler.handle_line(line, &tx).await,
        }

        // Reap finished requests so the set does not grow without bound.
        while let Some(done) = inflight.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "request task failed");
            }
        }
    }

    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "request task failed");
        }
    }
    drop(tx);
    if let Err(e) = writer.await {
        error!(error = %e, "writer task failed");
    }

    listener.abort();
    session.cancel();
    vault.lock().await;
    info!("shut down");
    Ok(())
}

async fn write_outbound(mut rx: mpsc::Receiver<OutboundMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to encode outbound message");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            error!(error = %e, "stdout closed");
            break;
        }
        if let Err(e) = stdout.flush().await {
            error!(error = %e, "stdout closed");
            break;
        }
    }
}
