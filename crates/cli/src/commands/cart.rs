//! Cart commands.

use cartsync::CartSession;
use cartsync_core::{LineId, ProductId, ProductSnapshot, Quantity};
use rust_decimal::Decimal;

use super::{CliError, print_cart};

/// Load the cart from the service, falling back to the cache.
pub async fn show(session: &CartSession) -> Result<(), CliError> {
    let cart = session.engine().fetch().await;
    print_cart(session, &cart)
}

/// Add units of a product.
///
/// `name` and `price` only matter when the service is unreachable and the
/// line is created locally.
pub async fn add(
    session: &CartSession,
    product: &str,
    quantity: i64,
    name: Option<String>,
    price: Option<Decimal>,
) -> Result<(), CliError> {
    let snapshot = product_snapshot(product, name, price)?;
    let cart = session.engine().add(snapshot, quantity).await;
    print_cart(session, &cart)
}

/// Build the snapshot for a local add, refusing prices no line could hold.
fn product_snapshot(
    product: &str,
    name: Option<String>,
    price: Option<Decimal>,
) -> Result<ProductSnapshot, CliError> {
    let mut snapshot = ProductSnapshot::bare(ProductId::from(product));
    if let Some(name) = name {
        snapshot.name = name;
    }
    if let Some(price) = price {
        snapshot.unit_price = price;
        snapshot.amount_for(Quantity::clamped(i64::from(Quantity::MAX)))?;
    }
    Ok(snapshot)
}

/// Set a line's quantity.
pub async fn set_quantity(session: &CartSession, line: &str, quantity: i64) -> Result<(), CliError> {
    let cart = session
        .engine()
        .set_quantity(LineId::from(line), quantity)
        .await;
    print_cart(session, &cart)
}

/// Remove a line.
pub async fn remove(session: &CartSession, line: &str) -> Result<(), CliError> {
    let cart = session.engine().remove(LineId::from(line)).await;
    print_cart(session, &cart)
}

/// Remove every line.
pub async fn clear(session: &CartSession) -> Result<(), CliError> {
    let cart = session.engine().clear_cart().await;
    print_cart(session, &cart)
}
