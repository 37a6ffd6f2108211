//! Drives one realtime connection on behalf of a [`Dispatcher`].
//!
//! # Protocol
//!
//! - Connects to the realtime WebSocket URL
//! - Sends the login frame returned by [`Dispatcher::on_open`]
//! - Feeds every payload frame to [`Dispatcher::on_message`]
//! - Answers pings; returns when the server closes or the stream fails
//!
//! Reconnecting is not attempted here. The dispatcher runs synchronously
//! (blocking HTTP included) inside `block_in_place`, so frames are handled
//! strictly one at a time.

use anyhow::{Context, Result};

use crate::dispatcher::Dispatcher;
use crate::ws::{self, WsMessage};

/// Run the realtime connection at `url` until it closes.
///
/// Builds its own runtime; must not be called from async code.
///
/// # Errors
///
/// Returns an error if the connection cannot be established, the login
/// frame cannot be built or sent, or the stream fails. A clean close from
/// the server is `Ok`.
pub fn run(dispatcher: &mut Dispatcher, url: &str) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(drive(dispatcher, url))
}

async fn drive(dispatcher: &mut Dispatcher, url: &str) -> Result<()> {
    dispatcher.start();
    log::info!("[connection] Connecting to {url}");

    let (mut writer, mut reader) = match ws::connect(url).await {
        Ok(halves) => halves,
        Err(e) => {
            dispatcher.on_error(&e);
            return Err(e);
        }
    };

    let login = match dispatcher.on_open() {
        Ok(frame) => frame,
        Err(e) => {
            if let Err(close_err) = writer.close().await {
                log::debug!("[connection] Failed to close after login error: {close_err}");
            }
            dispatcher.on_error(&e);
            return Err(e);
        }
    };
    if let Err(e) = writer.send_text(&login).await {
        dispatcher.on_error(&e);
        return Err(e);
    }
    log::debug!("[connection] Login frame sent");

    loop {
        match reader.recv().await {
            Some(Ok(WsMessage::Data(frame))) => {
                tokio::task::block_in_place(|| dispatcher.on_message(&frame));
            }
            Some(Ok(WsMessage::Ping(data))) => {
                if let Err(e) = writer.send_pong(data).await {
                    log::debug!("[connection] Failed to answer ping: {e}");
                }
            }
            Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close { code, reason })) => {
                dispatcher.on_close(Some(code), &reason);
                return Ok(());
            }
            Some(Err(e)) => {
                dispatcher.on_error(&e);
                return Err(e);
            }
            None => {
                dispatcher.on_close(None, "stream ended");
                return Ok(());
            }
        }
    }
}
