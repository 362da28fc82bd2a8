//! # Models
//!
//! The order aggregate: [`Order`] owns exactly one [`Delivery`], exactly one
//! [`Payment`] and an ordered list of [`Item`]s. The aggregate is persisted and
//! cached only as a whole.

pub mod order;

pub use order::{Delivery, Item, Order, Payment};
