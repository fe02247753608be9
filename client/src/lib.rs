//! # Reference Client Library
//!
//! A headless client for the Baby Steps relay server. It has no renderer or
//! game hooks; it exists to exercise a server end to end and to show how a
//! real mod client talks to it.
//!
//! ## Architecture Overview
//!
//! ### Connection
//! [`bot::Bot`] connects through [`shared::transport::client::ClientConnection`],
//! offering the protocol version followed by the password as its handshake key.
//! Reliable messages (info, chat, toggles) and unreliable ones (poses) share
//! the same connection.
//!
//! ### Local View
//! Every message from the server is deframed, decoded and applied to a
//! [`roster::Roster`], which tracks the remote players the way a game would
//! before drawing them.
//!
//! ## Module Organization
//!
//! ### Bot Module (`bot`)
//! - Handshake and info announcement
//! - Pose stream with a random-walk height
//! - Occasional jiminy toggles and an optional chat line
//!
//! ### Roster Module (`roster`)
//! - Own client id as assigned by the server
//! - Remote names, colours, accessories and toggles
//! - Last received pose per player
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::bot::{Bot, BotConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = BotConfig::new("127.0.0.1:7777".parse()?);
//!     config.duration = Some(Duration::from_secs(10));
//!
//!     let summary = Bot::connect(config).await?.run().await?;
//!     println!("sent {} poses", summary.poses_sent);
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod roster;
