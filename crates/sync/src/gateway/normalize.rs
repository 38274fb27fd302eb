//! Response shape normalization.
//!
//! The cart service answers in one of three shapes, all wrapped in a
//! `{ "success": bool, ... }` envelope:
//!
//! - **Explicit cart**: `{ "cart": { "items": [...], "totalItems": n, "subtotal": x } }`
//! - **Record array**: `[ { "_id": ..., "product": { ... }, "quantity": n }, ... ]`
//!   with server field names and no totals
//! - **Flat record**: `{ "items": [...], "totalQuantity": n, "totalPrice": x }`
//!
//! The payload is read from the envelope's `data` field when present,
//! otherwise from the envelope's remaining fields. Each shape maps
//! deterministically to a [`Cart`]; anything else is
//! [`PayloadShape::Unrecognized`] and maps to the canonical empty cart.
//! Totals are always re-derived from the lines; a payload whose amounts do
//! not fit in a `Decimal` is refused rather than normalized.

use cartsync_core::{Cart, CartError, CartLine, LineId, ProductId, Quantity};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

/// The `{ success, ... }` envelope around every cart response.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Whether the service accepted the request.
    pub success: bool,
    /// Human-readable error or status message.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// The wrapped payload.
    #[must_use]
    pub fn into_payload(self) -> serde_json::Value {
        self.data
            .unwrap_or(serde_json::Value::Object(self.rest))
    }
}

/// Which response shape a payload arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Explicit,
    Records,
    Flat,
    Unrecognized,
}

/// A normalized cart and the shape it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCart {
    pub cart: Cart,
    pub shape: PayloadShape,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CartPayload {
    Explicit { cart: ListedCart },
    Records(Vec<RemoteLine>),
    Flat(ListedCart),
    Unrecognized(serde_json::Value),
}

/// An object listing lines, with optional server totals.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedCart {
    items: Vec<RemoteLine>,
    #[serde(default, alias = "totalQuantity", alias = "total_items")]
    total_items: Option<i64>,
    #[serde(default, alias = "totalPrice", alias = "total_price")]
    subtotal: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteLine {
    #[serde(default, alias = "_id", alias = "lineId", alias = "cartItemId")]
    id: Option<LineId>,
    #[serde(default, alias = "product_id")]
    product_id: Option<ProductId>,
    #[serde(default)]
    product: Option<RemoteProduct>,
    #[serde(default, alias = "title", alias = "productName")]
    name: Option<String>,
    #[serde(default, alias = "price", alias = "unit_price")]
    unit_price: Option<Decimal>,
    #[serde(default, alias = "imageUrl", alias = "img")]
    image: Option<String>,
    #[serde(default, alias = "qty")]
    quantity: Option<i64>,
    #[serde(default, alias = "total", alias = "line_total", alias = "totalPrice")]
    line_total: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteProduct {
    #[serde(default, alias = "_id")]
    id: Option<ProductId>,
    #[serde(default, alias = "title")]
    name: Option<String>,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default, alias = "imageUrl")]
    image: Option<String>,
}

/// Normalize a response payload into the canonical cart.
///
/// # Errors
///
/// Returns `CartError::Overflow` if the lines' amounts are out of range.
pub fn normalize(payload: serde_json::Value) -> Result<RemoteCart, CartError> {
    let decoded = serde_json::from_value::<CartPayload>(payload)
        .unwrap_or(CartPayload::Unrecognized(serde_json::Value::Null));

    let remote = match decoded {
        CartPayload::Explicit { cart } => RemoteCart {
            cart: convert_listed(cart)?,
            shape: PayloadShape::Explicit,
        },
        CartPayload::Records(records) => RemoteCart {
            cart: Cart::from_lines(convert_lines(records))?,
            shape: PayloadShape::Records,
        },
        CartPayload::Flat(cart) => RemoteCart {
            cart: convert_listed(cart)?,
            shape: PayloadShape::Flat,
        },
        CartPayload::Unrecognized(value) => {
            warn!(
                payload = %value.to_string().chars().take(200).collect::<String>(),
                "Unrecognized cart payload, using empty cart"
            );
            RemoteCart {
                cart: Cart::empty(),
                shape: PayloadShape::Unrecognized,
            }
        }
    };
    Ok(remote)
}

fn convert_listed(listed: ListedCart) -> Result<Cart, CartError> {
    let cart = Cart::from_lines(convert_lines(listed.items))?;

    let items_disagree = listed
        .total_items
        .is_some_and(|n| n != i64::from(cart.total_items));
    let subtotal_disagrees = listed.subtotal.is_some_and(|s| s != cart.subtotal);
    if items_disagree || subtotal_disagrees {
        debug!(
            server_total_items = ?listed.total_items,
            server_subtotal = ?listed.subtotal,
            total_items = cart.total_items,
            subtotal = %cart.subtotal,
            "Server totals disagree with lines, using derived totals"
        );
    }

    Ok(cart)
}

fn convert_lines(records: Vec<RemoteLine>) -> Vec<CartLine> {
    records.into_iter().filter_map(convert_line).collect()
}

fn convert_line(record: RemoteLine) -> Option<CartLine> {
    let product = record.product.unwrap_or_default();

    let product_id = record.product_id.or(product.id);
    let Some(id) = record
        .id
        .or_else(|| product_id.as_ref().map(|p| LineId::new(p.as_str())))
    else {
        warn!("Dropping cart line without an identifier");
        return None;
    };
    let product_id = product_id.unwrap_or_else(|| ProductId::new(id.as_str()));

    let quantity = Quantity::clamped(record.quantity.unwrap_or(1));
    let unit_price = record
        .unit_price
        .or(product.price)
        .or_else(|| {
            record
                .line_total
                .and_then(|total| total.checked_div(Decimal::from(quantity.get())))
        })
        .unwrap_or(Decimal::ZERO);

    Some(CartLine {
        id,
        product_id,
        name: record.name.or(product.name).unwrap_or_default(),
        unit_price,
        image: record.image.or(product.image),
        quantity,
        line_total: record.line_total,
    })
}
