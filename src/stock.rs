// Stock validation of a cart against an inventory snapshot

use thiserror::Error;

use crate::checkout::CartItem;
use crate::inventory::InventoryRow;

/// Why a cart cannot be sold. The first offending item in cart order wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Product not found: {id}")]
    ProductNotFound { id: String },
    #[error("Not enough stock for {name}. Only {available} left, {requested} requested.")]
    InsufficientStock {
        id: String,
        name: String,
        available: u64,
        requested: u64,
    },
}

/// Checks every line against `snapshot`. The snapshot is evidence only; nothing is reserved.
pub fn validate(cart: &[CartItem], snapshot: &[InventoryRow]) -> Result<(), Rejection> {
    for item in cart {
        let row = snapshot
            .iter()
            .find(|row| row.id == item.id)
            .ok_or_else(|| Rejection::ProductNotFound {
                id: item.id.clone(),
            })?;

        let requested = u64::from(item.quantity());
        if row.available < requested {
            return Err(Rejection::InsufficientStock {
                id: item.id.clone(),
                name: item.name.clone(),
                available: row.available,
                requested,
            });
        }
    }
    Ok(())
}
