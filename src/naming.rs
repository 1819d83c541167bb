//! Type-tag normalization and subscription naming.
//!
//! Broker identifiers only allow a restricted character set, so Rust type
//! paths are normalized before they are used as filter values. Subscription
//! names are derived from the (message type, handler type) pair so that every
//! process computes the same name for the same registration.

use sha2::{Digest, Sha256};

/// Message property carrying the normalized message type.
pub const TYPE_TAG_PROPERTY: &str = "message_type";

/// Prefix of subscriptions shared by competing consumers across instances.
pub const COMPETING_PREFIX: &str = "C_";

/// Broker limit on subscription name length.
pub const MAX_SUBSCRIPTION_NAME_LEN: usize = 50;

/// Hex characters in the digest part of a subscription name.
pub const DIGEST_HEX_LEN: usize = 32;

/// Longest application id that still yields a valid exclusive subscription name.
pub const MAX_APPLICATION_ID_LEN: usize = MAX_SUBSCRIPTION_NAME_LEN - DIGEST_HEX_LEN - 1;

/// Normalize a type name into a broker-safe identifier.
///
/// `::` and `.` become `_`; any other character outside `[A-Za-z0-9_]`
/// (generic brackets, spaces, commas, references) becomes `_` as well.
///
/// ```
/// use mom_pubsub::normalize_type_name;
///
/// assert_eq!(normalize_type_name("orders::OrderPlaced"), "orders_OrderPlaced");
/// assert_eq!(normalize_type_name("Orders.OrderPlaced"), "Orders_OrderPlaced");
/// ```
pub fn normalize_type_name(name: &str) -> String {
    // ---
    name.replace("::", "_")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Normalized type tag of `T`.
pub fn type_tag_of<T: ?Sized>() -> String {
    normalize_type_name(std::any::type_name::<T>())
}

/// Derive the subscription name for a handler registration.
///
/// The digest is the first 16 bytes of SHA-256 over
/// `"{message_type}|{handler_type}"`, hex encoded (32 characters). Competing
/// registrations share the `C_` prefix across all application instances;
/// exclusive ones are prefixed with the application id.
pub fn subscription_name(
    application_id: &str,
    competing: bool,
    message_type: &str,
    handler_type: &str,
) -> String {
    // ---
    let mut hasher = Sha256::new();
    hasher.update(message_type.as_bytes());
    hasher.update(b"|");
    hasher.update(handler_type.as_bytes());
    let digest = hasher.finalize();
    let digest_hex = hex::encode(&digest[..DIGEST_HEX_LEN / 2]);

    if competing {
        format!("{COMPETING_PREFIX}{digest_hex}")
    } else {
        format!("{application_id}_{digest_hex}")
    }
}
