//! Lectern Core Library
//!
//! Client-side core of the Lectern lecture-slides study app: the streaming
//! chat transport, the protocol decoder it feeds on, the message store the
//! decoded events mutate, and the realtime merge layer for out-of-band push
//! updates (slide explanations, processing status, summary). Screens,
//! rendering, and the REST backend live elsewhere and are consumed through
//! the trait surface in [`api`].

pub mod api;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod realtime;
pub mod store;
pub mod transport;
