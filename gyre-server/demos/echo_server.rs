//! WebSocket echo server with a raw TCP admin port.
//!
//! ```text
//! cargo run -p gyre-server --example echo_server
//! websocat ws://127.0.0.1:9501/chat
//! nc 127.0.0.1 9502        # type "stats" or "reload"
//! ```
//!
//! SIGUSR1 reloads the workers; Ctrl-C stops the server.

use gyre_server::prelude::*;
use gyre_server::{init_logging, LogFormat};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(LogFormat::Text)?;

    let server = Server::builder()
        .host("127.0.0.1")
        .port(9501)
        .sock_type(SockType::WebSocket)
        .worker_num(2)
        .task_worker_num(1)
        .stop_grace(Duration::from_secs(5))
        .handle_signals(true)
        .build()?;

    server.on(|event: &mut OpenEvent, _: &mut Context<'_>| {
        println!("client {} opened {}", event.conn.connection_id, event.request.path());
        Ok(())
    })?;

    server.on(|event: &mut MessageEvent, ctx: &mut Context<'_>| {
        let id = event.conn.connection_id;
        match &event.frame.message {
            Message::Text(text) if text.starts_with("/count ") => {
                // word counting runs on the task worker
                ctx.task(json!({ "conn": id, "text": &text["/count ".len()..] }))?;
            }
            message => ctx.push(id, message.clone())?,
        }
        Ok(())
    })?;

    server.on(|event: &mut TaskEvent, _: &mut Context<'_>| {
        let words = event.data["text"].as_str().map_or(0, |t| t.split_whitespace().count());
        event.finish(json!({ "conn": event.data["conn"].clone(), "words": words }));
        Ok(())
    })?;

    server.on(|event: &mut FinishEvent, ctx: &mut Context<'_>| {
        if let Some(id) = event.data["conn"].as_u64() {
            if ctx.exists(id) {
                ctx.push(id, Message::text(format!("{} words", event.data["words"])))?;
            }
        }
        Ok(())
    })?;

    server.on(|event: &mut CloseEvent, _: &mut Context<'_>| {
        println!("client {} closed ({})", event.conn.connection_id, event.reason.as_str());
        Ok(())
    })?;

    let admin = server.add_sub_server(ListenerConfig::new("127.0.0.1", 9502, SockType::Tcp))?;
    admin.on(|event: &mut ReceiveEvent, ctx: &mut Context<'_>| {
        let id = event.conn.connection_id;
        match std::str::from_utf8(&event.data).unwrap_or_default().trim() {
            "stats" => {
                let line = format!("worker {} holds {} connections\n", event.conn.reactor_id, ctx.connections().len());
                ctx.send(id, line)?;
            }
            "reload" => {
                ctx.server().request_reload()?;
                ctx.send(id, "reloading\n")?;
            }
            _ => ctx.send(id, "commands: stats, reload\n")?,
        }
        Ok(())
    })?;

    server.listen().await?;
    Ok(())
}
