//! Order validation
//!
//! Business rules that must hold before an order is persisted or cached. The
//! validator is pure: it never touches the store, the cache or the broker, and
//! it reports the first failing field in a fixed check order.

use crate::constants::{EMAIL_PATTERN, STRICT_ORDER_UID_LENGTH};
use crate::models::{Delivery, Item, Order, Payment};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// First rule an order failed, with a dotted path to the offending field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation failed for {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Accepted shapes of `order_uid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderUidRule {
    /// Exactly 32 ASCII alphanumerics
    #[default]
    Strict,
    /// Any non-blank string
    Relaxed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrderValidator {
    uid_rule: OrderUidRule,
}

type Checked = std::result::Result<(), ValidationError>;

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(EMAIL_PATTERN).expect("email pattern is a valid regex"))
}

fn required(field: &str, value: &str) -> Checked {
    if value.trim().is_empty() {
        Err(ValidationError::new(field, "is required"))
    } else {
        Ok(())
    }
}

fn non_negative(field: &str, value: i64) -> Checked {
    if value < 0 {
        Err(ValidationError::new(field, format!("must not be negative, got {value}")))
    } else {
        Ok(())
    }
}

fn positive(field: &str, value: i64) -> Checked {
    if value <= 0 {
        Err(ValidationError::new(field, format!("must be greater than zero, got {value}")))
    } else {
        Ok(())
    }
}

impl OrderValidator {
    pub const fn new(uid_rule: OrderUidRule) -> Self {
        Self { uid_rule }
    }

    pub const fn strict() -> Self {
        Self::new(OrderUidRule::Strict)
    }

    pub const fn relaxed() -> Self {
        Self::new(OrderUidRule::Relaxed)
    }

    /// Strict when `strict_uid` is set, relaxed otherwise
    pub const fn from_flag(strict_uid: bool) -> Self {
        if strict_uid {
            Self::strict()
        } else {
            Self::relaxed()
        }
    }

    pub fn uid_rule(&self) -> OrderUidRule {
        self.uid_rule
    }

    pub fn validate(&self, order: &Order) -> Checked {
        self.validate_order_uid(&order.order_uid)?;

        required("track_number", &order.track_number)?;
        required("entry", &order.entry)?;
        required("locale", &order.locale)?;
        required("customer_id", &order.customer_id)?;
        required("delivery_service", &order.delivery_service)?;
        required("shardkey", &order.shardkey)?;
        required("oof_shard", &order.oof_shard)?;
        positive("sm_id", i64::from(order.sm_id))?;

        validate_delivery(&order.delivery)?;
        validate_payment(&order.payment)?;

        if order.items.is_empty() {
            return Err(ValidationError::new("items", "must contain at least one item"));
        }
        for (index, item) in order.items.iter().enumerate() {
            validate_item(index, item)?;
        }

        Ok(())
    }

    fn validate_order_uid(&self, uid: &str) -> Checked {
        required("order_uid", uid)?;
        if self.uid_rule == OrderUidRule::Strict {
            if uid.len() != STRICT_ORDER_UID_LENGTH {
                return Err(ValidationError::new(
                    "order_uid",
                    format!("must be exactly {STRICT_ORDER_UID_LENGTH} characters, got {}", uid.len()),
                ));
            }
            if !uid.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ValidationError::new(
                    "order_uid",
                    "must contain only ASCII letters and digits",
                ));
            }
        }
        Ok(())
    }
}

fn validate_delivery(delivery: &Delivery) -> Checked {
    required("delivery.name", &delivery.name)?;
    required("delivery.phone", &delivery.phone)?;
    required("delivery.zip", &delivery.zip)?;
    required("delivery.city", &delivery.city)?;
    required("delivery.address", &delivery.address)?;
    required("delivery.region", &delivery.region)?;
    required("delivery.email", &delivery.email)?;
    if !email_regex().is_match(&delivery.email) {
        return Err(ValidationError::new(
            "delivery.email",
            format!("is not a valid email address: {}", delivery.email),
        ));
    }
    Ok(())
}

fn validate_payment(payment: &Payment) -> Checked {
    required("payment.transaction", &payment.transaction)?;
    required("payment.currency", &payment.currency)?;
    required("payment.provider", &payment.provider)?;
    required("payment.bank", &payment.bank)?;
    non_negative("payment.amount", payment.amount)?;
    positive("payment.payment_dt", payment.payment_dt)?;
    non_negative("payment.delivery_cost", payment.delivery_cost)?;
    non_negative("payment.goods_total", payment.goods_total)?;
    non_negative("payment.custom_fee", payment.custom_fee)
}

fn validate_item(index: usize, item: &Item) -> Checked {
    let field = |name: &str| format!("items[{index}].{name}");

    required(&field("track_number"), &item.track_number)?;
    required(&field("rid"), &item.rid)?;
    required(&field("name"), &item.name)?;
    required(&field("size"), &item.size)?;
    required(&field("brand"), &item.brand)?;
    positive(&field("chrt_id"), item.chrt_id)?;
    positive(&field("nm_id"), item.nm_id)?;
    non_negative(&field("price"), item.price)?;
    non_negative(&field("total_price"), item.total_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::producer::generate_test_order;

    fn field_of(result: Checked) -> String {
        result.unwrap_err().field
    }

    #[test]
    fn test_generated_order_passes_strict_rule() {
        let order = generate_test_order(7);
        assert_eq!(OrderValidator::strict().validate(&order), Ok(()));
        assert_eq!(OrderValidator::relaxed().validate(&order), Ok(()));
    }

    #[test]
    fn test_short_uid_only_passes_relaxed_rule() {
        let mut order = generate_test_order(1);
        order.order_uid = "b563feb7b2b84b6test".to_string();

        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "order_uid");
        assert!(OrderValidator::relaxed().validate(&order).is_ok());
    }

    #[test]
    fn test_non_alphanumeric_uid_rejected_by_strict_rule() {
        let mut order = generate_test_order(1);
        order.order_uid = format!("{}-", &order.order_uid[..31]);
        let err = OrderValidator::strict().validate(&order).unwrap_err();
        assert_eq!(err.field, "order_uid");
        assert!(err.reason.contains("letters and digits"));
    }

    #[test]
    fn test_blank_uid_rejected_by_both_rules() {
        let mut order = generate_test_order(1);
        order.order_uid = "   ".to_string();
        assert_eq!(field_of(OrderValidator::relaxed().validate(&order)), "order_uid");
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "order_uid");
    }

    #[test]
    fn test_check_order_reports_first_failure() {
        let mut order = generate_test_order(2);
        order.track_number.clear();
        order.delivery.email = "not-an-email".to_string();
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "track_number");
    }

    #[test]
    fn test_zero_shard_id_rejected() {
        let mut order = generate_test_order(3);
        order.sm_id = 0;
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "sm_id");
    }

    #[test]
    fn test_invalid_email_rejected() {
        let mut order = generate_test_order(4);
        order.delivery.email = "user@localhost".to_string();
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "delivery.email");
    }

    #[test]
    fn test_payment_rules() {
        let mut order = generate_test_order(5);
        order.payment.payment_dt = 0;
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "payment.payment_dt");

        let mut order = generate_test_order(5);
        order.payment.custom_fee = -1;
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "payment.custom_fee");

        let mut order = generate_test_order(5);
        order.payment.request_id.clear();
        assert!(OrderValidator::strict().validate(&order).is_ok());
    }

    #[test]
    fn test_item_rules() {
        let mut order = generate_test_order(6);
        order.items.clear();
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "items");

        let mut order = generate_test_order(6);
        let last = order.items.len() - 1;
        order.items[last].nm_id = 0;
        assert_eq!(
            field_of(OrderValidator::strict().validate(&order)),
            format!("items[{last}].nm_id")
        );

        let mut order = generate_test_order(6);
        order.items[0].price = -5;
        assert_eq!(field_of(OrderValidator::strict().validate(&order)), "items[0].price");
    }

    #[test]
    fn test_empty_decoded_order_fails_on_uid() {
        let order = Order::from_json_bytes(br#"{"not":"valid"}"#).unwrap();
        let err = OrderValidator::relaxed().validate(&order).unwrap_err();
        assert_eq!(err.field, "order_uid");
        assert_eq!(err.to_string(), "Validation failed for order_uid: is required");
    }

    #[test]
    fn test_from_flag() {
        assert_eq!(OrderValidator::from_flag(true).uid_rule(), OrderUidRule::Strict);
        assert_eq!(OrderValidator::from_flag(false).uid_rule(), OrderUidRule::Relaxed);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn strict_rule_accepts_any_32_char_alphanumeric_uid(uid in "[A-Za-z0-9]{32}") {
                let mut order = generate_test_order(11);
                order.order_uid = uid;
                prop_assert!(OrderValidator::strict().validate(&order).is_ok());
            }

            #[test]
            fn strict_rule_rejects_other_lengths(uid in "[A-Za-z0-9]{1,31}|[A-Za-z0-9]{33,48}") {
                let mut order = generate_test_order(11);
                order.order_uid = uid;
                let err = OrderValidator::strict().validate(&order).unwrap_err();
                prop_assert_eq!(err.field, "order_uid");
            }

            #[test]
            fn negative_money_is_always_rejected(amount in i64::MIN..0) {
                let mut order = generate_test_order(12);
                order.payment.amount = amount;
                prop_assert!(OrderValidator::relaxed().validate(&order).is_err());
            }
        }
    }
}
