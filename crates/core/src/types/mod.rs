//! Core types for cartsync.
//!
//! This module provides type-safe wrappers for cart and credential concepts.

pub mod cart;
pub mod credential;
pub mod id;
pub mod quantity;

pub use cart::{Cart, CartError, CartLine, ProductSnapshot};
pub use credential::{BearerToken, TokenClaims, TokenError};
pub use id::{LineId, ProductId};
pub use quantity::Quantity;
