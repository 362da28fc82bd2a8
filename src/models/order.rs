use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Order aggregate root as carried on the wire and stored across the
/// `orders`, `delivery`, `payment` and `items` tables.
///
/// Missing JSON fields decode to their empty values so that shape problems are
/// reported field-by-field by the validator rather than as opaque decode errors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, FromRow)]
#[serde(default)]
pub struct Order {
    pub order_uid: String,
    pub track_number: String,
    pub entry: String,
    #[sqlx(flatten)]
    pub delivery: Delivery,
    #[sqlx(flatten)]
    pub payment: Payment,
    #[sqlx(skip)]
    pub items: Vec<Item>,
    pub locale: String,
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub shardkey: String,
    pub sm_id: i32,
    pub date_created: Option<DateTime<Utc>>,
    pub oof_shard: String,
}

/// Recipient details, one per order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, FromRow)]
#[serde(default)]
pub struct Delivery {
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

/// Payment details, one per order. Money is in integer minor units and
/// `payment_dt` is unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, FromRow)]
#[serde(default)]
pub struct Payment {
    pub transaction: String,
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    pub amount: i64,
    pub payment_dt: i64,
    pub bank: String,
    pub delivery_cost: i64,
    pub goods_total: i64,
    pub custom_fee: i64,
}

/// Order line. The full list is replaced whenever the order is re-processed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, FromRow)]
#[serde(default)]
pub struct Item {
    pub chrt_id: i64,
    pub track_number: String,
    pub price: i64,
    pub rid: String,
    pub name: String,
    pub sale: i32,
    pub size: String,
    pub total_price: i64,
    pub nm_id: i64,
    pub brand: String,
    pub status: i32,
}

impl Order {
    /// Decode an order from a raw broker payload
    pub fn from_json_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Fill `date_created` with `now` when the producer did not set it
    pub fn ensure_created_at(&mut self, now: DateTime<Utc>) {
        if self.date_created.is_none() {
            self.date_created = Some(now);
        }
    }

    /// Sum of item total prices in minor units
    pub fn items_total(&self) -> i64 {
        self.items.iter().map(|item| item.total_price).sum()
    }
}
