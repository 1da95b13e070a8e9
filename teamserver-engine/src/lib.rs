//! # teamserver-engine
//!
//! Runtime of the team server, embedded by the CLI and by applications that
//! host their own methods.
//!
//! This crate provides:
//! - **Certificate authorities** issuing and revoking client/server leaves
//! - **Credential store** of users and hashed bearer tokens (SQLite)
//! - **Per-call authentication** with a revocation-aware cache
//! - **Transport handlers**: QUIC with mutual TLS, and an in-process pipe
//! - **Listener supervisor** with persistent listeners restarted by the
//!   daemon
//! - **Server and client bootstrap** tying all of the above together

pub mod auth;
pub mod certs;
pub mod client;
pub mod config;
pub mod handler;
pub mod jobs;
pub mod local;
pub mod quic;
pub mod rpc;
pub mod server;
pub mod session;
pub mod store;

pub use client::{Client, ClientBuilder, Dialer};
pub use server::{Server, ServerVersion, UserStatus};
