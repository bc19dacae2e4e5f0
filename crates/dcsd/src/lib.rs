//! DCS Daemon - lock registry and transport for shared instrument devices
//!
//! This crate provides the core infrastructure for the coordination daemon:
//! - `config` - TOML configuration with environment overrides
//! - `catalog` - Device registry adapter (swappable catalog snapshot)
//! - `registry` - Lock table, arbitration and session actor, plus the lease reaper
//! - `server` - axum HTTP routes and WebSocket subscription connections
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        dcsd daemon                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│     RegistryActor           │    │
//! │  │ (HTTP + WS)     │     │ (lock table + sessions)     │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │                             │                   │
//! │           │ connections                 │ LockEvent         │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ WsConnection    │◀────│   SubscriberHub             │    │
//! │  │ (per session)   │     │   (bounded per-session)     │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                         ▲                   │
//! │  ┌─────────────────┐                    │ Sweep             │
//! │  │ DeviceDirectory │    lease reaper ───┘                   │
//! │  │ (arc-swap)      │                                        │
//! │  └─────────────────┘                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod catalog;
pub mod config;
pub mod registry;
pub mod server;
