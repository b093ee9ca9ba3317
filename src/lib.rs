//! ## Multi-tenant WebDAV server with path-scoped permissions
//!
//! This crate puts a configurable authorization front-end in front of a
//! stock [RFC 4918] WebDAV handler. The protocol engine itself comes from
//! the [`dav_server`] crate; what lives here is everything around it:
//!
//! - a per-user permission model (Create/Read/Update/Delete capability
//!   sets plus ordered path rules, prefix or regex, last match wins)
//!   mapped onto every WebDAV verb, including the dual source/destination
//!   semantics of COPY and MOVE ([`permissions`]);
//! - Basic authentication with plaintext or bcrypt secrets ([`user`]);
//! - a per-user filesystem root and lock namespace over one shared lock
//!   service ([`fs`], [`ls`]);
//! - the request pipeline that authenticates, rewrites the URL prefix and
//!   Destination header, enforces permissions, coerces GET on a
//!   collection into PROPFIND, and delegates to the verb handler
//!   ([`handler`]);
//! - a layered configuration loader (file, environment, flags, defaults)
//!   with a per-user cascade ([`config`]), an optional CORS filter
//!   ([`cors`]) and the TCP/UNIX/socket-activation serving loop
//!   ([`server`]).
//!
//! The `webdav` binary wires these together behind a small CLI; see the
//! README for the configuration format.
//!
//! [RFC 4918]: https://datatracker.ietf.org/doc/html/rfc4918

pub mod config;
pub mod cors;
pub mod fs;
pub mod handler;
pub mod ls;
pub mod permissions;
pub mod server;
pub mod user;

pub use crate::config::{parse_config, Config, ConfigError};
pub use crate::handler::Handler;
pub use crate::permissions::{Permissions, Rule, UserPermissions};
pub use crate::server::serve;
pub use crate::user::User;
