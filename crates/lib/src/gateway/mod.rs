//! Gateway: the HTTP surface.
//!
//! Single port serves `GET /log-stream` (SSE), `POST /chat` (SSE) and `GET /screenshot` (JSON),
//! plus a health probe at `GET /`.

mod server;

pub use server::{router, run_gateway, serve, GatewayState, CHAT_ERROR_PREFIX};
