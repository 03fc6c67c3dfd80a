//! tinycam-core - shared library for the tinycam camera worker.
//!
//! This crate implements the live-streaming pipeline that sits between an
//! external video encoder process and authenticated WebSocket clients: the
//! encoder-process supervisor, the init/preroll cache, the subscriber
//! fan-out, per-connection session crypto, and the WebSocket session state
//! machine. It also carries a client-side mirror of the wire protocol
//! ([`player`]) used both by integration tests and by the `tinycam-player`
//! CLI.
//!
//! # Architecture
//!
//! - [`process`]: OS-abstracted process spawn/terminate/kill (`ProcessGuardian`)
//!   and cross-process device arbitration (`DeviceLock`).
//! - [`encoder`]: `EncoderSupervisor`, the perpetual spawn/read/restart loop.
//! - [`init_cache`]: `InitCache`, container-aware init-segment sniffing.
//! - [`broadcast`]: `Broadcaster`, bounded drop-oldest subscriber fan-out.
//! - [`crypto`]: `SessionCrypto`, HKDF key derivation and per-frame AEAD.
//! - [`session`]: `StreamSession`, the `/stream` WebSocket state machine.
//! - [`player`]: the client-side mirror of the wire protocol.
//! - [`config`]: `EncoderConfig`/`Codec`, the encoder invocation contract.
//! - [`keys`]: `KeyMaterial`, access/management key persistence and rotation.
//! - [`error`]: centralized error types shared across the crate.

#![warn(clippy::all)]

pub mod broadcast;
pub mod config;
pub mod crypto;
pub mod encoder;
pub mod error;
pub mod init_cache;
pub mod keys;
pub mod player;
pub mod process;
pub mod queue;
pub mod session;
pub mod utils;

pub use broadcast::{Broadcaster, Subscription};
pub use config::{Codec, EncoderConfig};
pub use crypto::SessionCrypto;
pub use encoder::EncoderSupervisor;
pub use error::{ErrorCode, TinycamError, TinycamResult};
pub use init_cache::{ContainerKind, InitCache};
pub use keys::KeyMaterial;
pub use player::{MediaBuffer, Player, Retention};
pub use process::{DeviceLock, Process, ProcessGuardian};
pub use session::{stream_handler, StreamParams, StreamingApp};
