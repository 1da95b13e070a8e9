//! # teamserver-core
//!
//! Shared building blocks for the team server connection layer.
//!
//! This crate provides the types and helpers used by `teamserver-engine`
//! and the `teamserver` binary.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives**: frame format (magic / version / type / length)
//!   and the JSON call, reply and error payloads.
//!
//! - **Connections**: the transport-agnostic [`transport::Connection`] trait
//!   and frame read/write helpers over it.
//!
//! - **PKI**: ECDSA P-384 authority and leaf generation, PEM inspection, and
//!   the mutual-TLS `rustls` configs built from them.
//!
//! - **Client descriptors and tokens**: the JSON connection descriptor handed
//!   to users, bearer token generation and hashing.
//!
//! - **Error taxonomy** shared by every crate in the workspace.
pub mod descriptor;
pub mod error;
pub mod fs;
pub mod protocol;
pub mod tls;
pub mod token;
pub mod transport;
