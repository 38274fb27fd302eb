//! cartsync Core - Shared cart and credential types.
//!
//! This crate provides the types used across all cartsync components:
//! - `cartsync` - Credential coordination, remote gateway, cache and sync engine
//! - `cartsync-cli` - Command-line driver for the sync engine
//!
//! # Architecture
//!
//! The core crate contains only types and pure arithmetic - no I/O, no storage
//! access, no HTTP clients. This keeps it lightweight and allows it to be used
//! anywhere.
//!
//! # Modules
//!
//! - [`types`] - Line/product IDs, clamped quantities, the canonical cart and
//!   bearer tokens

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
