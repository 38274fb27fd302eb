//! The canonical cart representation.
//!
//! A [`Cart`] is the single agreed-upon shape shared by the in-memory store,
//! the durable cache and the normalized server responses. Its totals are
//! always consistent with its lines:
//!
//! - `total_items == Σ line.quantity`
//! - `subtotal == Σ line.amount()` where a line's amount is its server-supplied
//!   `line_total` when present, otherwise `unit_price × quantity`
//!
//! Mutating methods apply deltas to the totals rather than recomputing from
//! scratch, so line order and identity are preserved across local edits.
//!
//! All money arithmetic is checked. An operation whose amounts would leave
//! the `Decimal` range fails with [`CartError::Overflow`] and leaves the cart
//! untouched.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::id::{LineId, ProductId};
use super::quantity::Quantity;

/// Reasons a cart operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CartError {
    /// A line amount or the subtotal does not fit in a `Decimal`.
    #[error("cart amount out of range")]
    Overflow,
}

/// A single line in the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    /// Line identifier within the cart.
    pub id: LineId,
    /// Catalog product identifier.
    pub product_id: ProductId,
    /// Product display name.
    #[serde(default)]
    pub name: String,
    /// Price of a single unit.
    pub unit_price: Decimal,
    /// Product image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Number of units, clamped to `[1, 99]`.
    pub quantity: Quantity,
    /// Server-supplied total for this line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_total: Option<Decimal>,
}

impl CartLine {
    /// Amount this line contributes to the subtotal.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Overflow` if `unit_price × quantity` is out of range.
    pub fn amount(&self) -> Result<Decimal, CartError> {
        match self.line_total {
            Some(total) => Ok(total),
            None => line_amount(self.unit_price, self.quantity),
        }
    }

    /// This line at another quantity, with a present `line_total` kept in step.
    fn with_quantity(&self, quantity: Quantity) -> Result<Self, CartError> {
        let line_total = match self.line_total {
            Some(_) => Some(line_amount(self.unit_price, quantity)?),
            None => None,
        };
        Ok(Self {
            quantity,
            line_total,
            ..self.clone()
        })
    }
}

fn line_amount(unit_price: Decimal, quantity: Quantity) -> Result<Decimal, CartError> {
    unit_price
        .checked_mul(Decimal::from(quantity.get()))
        .ok_or(CartError::Overflow)
}

/// Units and subtotal derived from `lines`.
fn derive_totals(lines: &[CartLine]) -> Result<(u32, Decimal), CartError> {
    lines
        .iter()
        .try_fold((0u32, Decimal::ZERO), |(units, subtotal), line| {
            let subtotal = subtotal
                .checked_add(line.amount()?)
                .ok_or(CartError::Overflow)?;
            Ok::<_, CartError>((units.saturating_add(line.quantity.get()), subtotal))
        })
}

/// Product details the caller already has when adding to the cart.
///
/// The remote add operation only needs the product ID, but an optimistic
/// local add has to render a line without a server round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    /// Catalog product identifier.
    pub product_id: ProductId,
    /// Product display name.
    pub name: String,
    /// Price of a single unit.
    pub unit_price: Decimal,
    /// Product image URL.
    #[serde(default)]
    pub image: Option<String>,
}

impl ProductSnapshot {
    /// Snapshot carrying only the product ID (name and price unknown).
    #[must_use]
    pub fn bare(product_id: ProductId) -> Self {
        Self {
            product_id,
            name: String::new(),
            unit_price: Decimal::ZERO,
            image: None,
        }
    }

    /// Amount of `quantity` units of this product.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Overflow` if the amount is out of range.
    pub fn amount_for(&self, quantity: Quantity) -> Result<Decimal, CartError> {
        line_amount(self.unit_price, quantity)
    }
}

/// The canonical cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    /// Cart lines in display order.
    pub items: Vec<CartLine>,
    /// Total number of units across all lines.
    pub total_items: u32,
    /// Sum of line amounts.
    pub subtotal: Decimal,
}

impl Default for Cart {
    fn default() -> Self {
        Self::empty()
    }
}

impl Cart {
    /// The canonical empty cart.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_items: 0,
            subtotal: Decimal::ZERO,
        }
    }

    /// Build a cart from lines, deriving totals.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Overflow` if the lines' amounts are out of range.
    pub fn from_lines(items: Vec<CartLine>) -> Result<Self, CartError> {
        let (total_items, subtotal) = derive_totals(&items)?;
        Ok(Self {
            items,
            total_items,
            subtotal,
        })
    }

    /// Whether the cart has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Find a line by its ID.
    #[must_use]
    pub fn line(&self, id: &LineId) -> Option<&CartLine> {
        self.items.iter().find(|line| &line.id == id)
    }

    /// Find the line holding a given product.
    #[must_use]
    pub fn line_for_product(&self, product_id: &ProductId) -> Option<&CartLine> {
        self.items.iter().find(|line| &line.product_id == product_id)
    }

    /// IDs of every line, in order.
    #[must_use]
    pub fn line_ids(&self) -> Vec<LineId> {
        self.items.iter().map(|line| line.id.clone()).collect()
    }

    /// Whether the totals agree with the lines.
    ///
    /// A cart whose lines cannot be summed is never consistent.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        derive_totals(&self.items).is_ok_and(|(total_items, subtotal)| {
            total_items == self.total_items && subtotal == self.subtotal
        })
    }

    /// Re-derive totals from the lines.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Overflow` if the lines' amounts are out of range;
    /// the totals are left as they were.
    pub fn recompute_totals(&mut self) -> Result<(), CartError> {
        (self.total_items, self.subtotal) = derive_totals(&self.items)?;
        Ok(())
    }

    /// Set a line's quantity, applying the delta to the totals.
    ///
    /// Returns `Ok(false)` if no line has this ID.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Overflow` if the new amounts are out of range.
    pub fn set_quantity(&mut self, id: &LineId, quantity: Quantity) -> Result<bool, CartError> {
        let Some(line) = self.items.iter_mut().find(|line| &line.id == id) else {
            return Ok(false);
        };

        let updated = line.with_quantity(quantity)?;
        let (old_amount, new_amount) = (line.amount()?, updated.amount()?);
        let subtotal = self
            .subtotal
            .checked_sub(old_amount)
            .and_then(|rest| rest.checked_add(new_amount))
            .ok_or(CartError::Overflow)?;
        let total_items = self
            .total_items
            .saturating_sub(line.quantity.get())
            .saturating_add(quantity.get());

        *line = updated;
        self.total_items = total_items;
        self.subtotal = subtotal;
        Ok(true)
    }

    /// Remove a line, subtracting it from the totals.
    pub fn remove_line(&mut self, id: &LineId) -> Option<CartLine> {
        let index = self.items.iter().position(|line| &line.id == id)?;
        let line = self.items.remove(index);
        self.total_items = self.total_items.saturating_sub(line.quantity.get());
        let remaining = line
            .amount()
            .ok()
            .and_then(|amount| self.subtotal.checked_sub(amount));
        match remaining {
            Some(subtotal) => self.subtotal = subtotal,
            // Totals were already out of step with the lines
            None => {
                if let Ok((total_items, subtotal)) = derive_totals(&self.items) {
                    self.total_items = total_items;
                    self.subtotal = subtotal;
                }
            }
        }
        Some(line)
    }

    /// Add units of a product.
    ///
    /// Merges into the existing line for the product if there is one,
    /// otherwise appends a line with a locally synthesized ID. Returns the ID
    /// of the affected line.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Overflow` if the resulting amounts are out of
    /// range; the cart is left unchanged.
    pub fn add_product(
        &mut self,
        product: &ProductSnapshot,
        quantity: Quantity,
    ) -> Result<LineId, CartError> {
        if let Some(existing) = self.line_for_product(&product.product_id) {
            let id = existing.id.clone();
            let merged = existing.quantity.saturating_add(quantity);
            self.set_quantity(&id, merged)?;
            return Ok(id);
        }

        let line = CartLine {
            id: LineId::local(),
            product_id: product.product_id.clone(),
            name: product.name.clone(),
            unit_price: product.unit_price,
            image: product.image.clone(),
            quantity,
            line_total: None,
        };
        let subtotal = self
            .subtotal
            .checked_add(line.amount()?)
            .ok_or(CartError::Overflow)?;
        let id = line.id.clone();
        self.total_items = self.total_items.saturating_add(quantity.get());
        self.subtotal = subtotal;
        self.items.push(line);
        Ok(id)
    }

    /// Whether any line exists only locally.
    #[must_use]
    pub fn has_local_lines(&self) -> bool {
        self.items.iter().any(|line| line.id.is_local())
    }
}
