//! # Gyre
//!
//! Event-driven network server core. One listener (plus any number of
//! sub-server listeners) feeds a pool of supervised event workers; blocking
//! work goes to task workers and comes back to the worker that asked for it.
//! Listeners speak raw TCP, UDP or RFC 6455 WebSocket.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gyre::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> gyre::server::Result<()> {
//!     let server = Server::builder()
//!         .port(9502)
//!         .worker_num(2)
//!         .task_worker_num(2)
//!         .build()?;
//!
//!     server.on(|event: &mut ReceiveEvent, ctx: &mut Context<'_>| {
//!         let text = String::from_utf8_lossy(&event.data).into_owned();
//!         ctx.task(serde_json::json!({ "conn": event.conn.connection_id, "text": text }))?;
//!         Ok(())
//!     })?;
//!     server.on(|event: &mut TaskEvent, _: &mut Context<'_>| {
//!         event.finish(event.data.clone());
//!         Ok(())
//!     })?;
//!     server.on(|event: &mut FinishEvent, ctx: &mut Context<'_>| {
//!         if let Some(conn) = event.data["conn"].as_u64() {
//!             let text = event.data["text"].as_str().unwrap_or_default().to_uppercase();
//!             ctx.send(conn, text)?;
//!         }
//!         Ok(())
//!     })?;
//!
//!     server.listen().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

// Re-export core components
pub use gyre_core::*;

#[cfg(feature = "net")]
pub use gyre_transport_net as transport_net;

#[cfg(feature = "server")]
pub use gyre_server as server;

/// Prelude module with common imports
///
/// With the `server` feature, `Result` is the server's result type.
pub mod prelude {
    #[cfg(not(feature = "server"))]
    pub use gyre_core::prelude::*;

    #[cfg(feature = "server")]
    pub use gyre_server::prelude::*;

    #[cfg(feature = "net")]
    pub use gyre_transport_net::prelude::*;
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_crate_name() {
        assert_eq!(env!("CARGO_PKG_NAME"), "gyre");
    }

    #[cfg(feature = "server")]
    #[test]
    fn test_prelude_result_is_the_server_result() {
        use crate::prelude::*;
        use gyre_server::error::ConfigError;

        let result: Result<()> = Err(ServerError::from(ConfigError::AlreadyStarted));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
