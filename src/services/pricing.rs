//! Cart pricing in integer minor-currency units.
//!
//! All arithmetic happens in cents to avoid floating-point drift; `Decimal`
//! values appear only at the boundary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::entities::coupon::{self, DiscountType};
use crate::errors::ServiceError;

/// Orders at or above this subtotal ship free.
pub const FREE_SHIPPING_THRESHOLD_CENTS: i64 = 50_00;
/// Flat shipping cost below the free-shipping threshold.
pub const SHIPPING_FLAT_CENTS: i64 = 4_99;

/// A cart line as seen by the calculator.
#[derive(Debug, Clone)]
pub struct CartLine {
    pub unit_price: Decimal,
    pub quantity: i32,
}

/// Cart totals, all in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingBreakdown {
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
}

impl PricingBreakdown {
    pub fn is_free_order(&self) -> bool {
        self.total_cents == 0
    }

    pub fn subtotal(&self) -> Decimal {
        cents_to_decimal(self.subtotal_cents)
    }

    pub fn shipping(&self) -> Decimal {
        cents_to_decimal(self.shipping_cents)
    }

    pub fn discount(&self) -> Decimal {
        cents_to_decimal(self.discount_cents)
    }

    pub fn total(&self) -> Decimal {
        cents_to_decimal(self.total_cents)
    }
}

/// Converts a decimal currency amount to cents, rounding half away from zero.
pub fn decimal_to_cents(amount: Decimal) -> i64 {
    (amount * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Converts cents back to a two-fraction-digit decimal.
pub fn cents_to_decimal(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Computes subtotal, shipping, discount and total for a cart.
///
/// Rounding to the minor unit happens per line before summation so that
/// multi-quantity lines cannot accumulate sub-cent drift. The total is
/// clamped at zero; a zero total marks a free order that bypasses the
/// payment processor entirely.
pub fn price_cart(
    lines: &[CartLine],
    coupon: Option<&coupon::Model>,
) -> Result<PricingBreakdown, ServiceError> {
    let subtotal_cents: i64 = lines
        .iter()
        .map(|line| decimal_to_cents(line.unit_price) * i64::from(line.quantity))
        .sum();

    let shipping_cents = if subtotal_cents >= FREE_SHIPPING_THRESHOLD_CENTS {
        0
    } else {
        SHIPPING_FLAT_CENTS
    };

    let discount_cents = match coupon {
        Some(coupon) => coupon_discount_cents(coupon, subtotal_cents)?,
        None => 0,
    };

    let total_cents = (subtotal_cents + shipping_cents - discount_cents).max(0);

    Ok(PricingBreakdown {
        subtotal_cents,
        shipping_cents,
        discount_cents,
        total_cents,
    })
}

fn coupon_discount_cents(
    coupon: &coupon::Model,
    subtotal_cents: i64,
) -> Result<i64, ServiceError> {
    let min_cents = decimal_to_cents(coupon.min_order_amount);
    if subtotal_cents < min_cents {
        return Err(ServiceError::ValidationError(format!(
            "Coupon {} requires a minimum order of {}",
            coupon.code, coupon.min_order_amount
        )));
    }

    let discount = match coupon.discount_type {
        DiscountType::FixedAmount => decimal_to_cents(coupon.discount_value),
        DiscountType::Percentage => {
            let subtotal = cents_to_decimal(subtotal_cents);
            decimal_to_cents(subtotal * coupon.discount_value / Decimal::from(100))
        }
    };

    Ok(discount.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use test_case::test_case;
    use uuid::Uuid;

    fn line(price: Decimal, quantity: i32) -> CartLine {
        CartLine {
            unit_price: price,
            quantity,
        }
    }

    fn fixed_coupon(value: Decimal, min_order: Decimal) -> coupon::Model {
        coupon::Model {
            id: Uuid::new_v4(),
            code: "TEST".into(),
            discount_type: DiscountType::FixedAmount,
            discount_value: value,
            min_order_amount: min_order,
            max_uses: None,
            current_uses: 0,
            is_active: true,
            banner_enabled: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn percentage_coupon(value: Decimal) -> coupon::Model {
        coupon::Model {
            discount_type: DiscountType::Percentage,
            ..fixed_coupon(value, dec!(0))
        }
    }

    #[test_case(dec!(50.00), 0 ; "at threshold ships free")]
    #[test_case(dec!(49.99), 499 ; "below threshold pays flat rate")]
    #[test_case(dec!(120.00), 0 ; "well above threshold ships free")]
    #[test_case(dec!(0.01), 499 ; "tiny order pays flat rate")]
    fn free_shipping_threshold(subtotal: Decimal, expected_shipping: i64) {
        let breakdown = price_cart(&[line(subtotal, 1)], None).unwrap();
        assert_eq!(breakdown.shipping_cents, expected_shipping);
    }

    #[test]
    fn per_line_rounding_happens_before_summation() {
        // 3 x 0.333 rounds each line to 33 cents, not 99.9 -> 100
        let breakdown = price_cart(&[line(dec!(0.333), 3)], None).unwrap();
        assert_eq!(breakdown.subtotal_cents, 99);
    }

    #[test]
    fn total_is_never_negative() {
        let coupon = fixed_coupon(dec!(100.00), dec!(0));
        let breakdown = price_cart(&[line(dec!(5.00), 1)], Some(&coupon)).unwrap();
        assert_eq!(breakdown.total_cents, 0);
        assert!(breakdown.is_free_order());
    }

    #[test]
    fn totals_satisfy_invariant() {
        let coupon = percentage_coupon(dec!(10));
        let breakdown = price_cart(&[line(dec!(19.99), 2), line(dec!(4.50), 1)], Some(&coupon))
            .unwrap();
        assert_eq!(
            breakdown.total_cents,
            (breakdown.subtotal_cents + breakdown.shipping_cents - breakdown.discount_cents)
                .max(0)
        );
        assert!(breakdown.total_cents >= 0);
    }

    #[test]
    fn scenario_a_subtotal_45_no_coupon() {
        let breakdown = price_cart(&[line(dec!(45.00), 1)], None).unwrap();
        assert_eq!(breakdown.shipping_cents, 499);
        assert_eq!(breakdown.total_cents, 49_99);
    }

    #[test]
    fn scenario_b_subtotal_60_fixed_10() {
        let coupon = fixed_coupon(dec!(10.00), dec!(0));
        let breakdown = price_cart(&[line(dec!(60.00), 1)], Some(&coupon)).unwrap();
        assert_eq!(breakdown.shipping_cents, 0);
        assert_eq!(breakdown.discount_cents, 10_00);
        assert_eq!(breakdown.total_cents, 50_00);
    }

    #[test]
    fn scenario_c_exact_zero_total_is_free_order() {
        // 5.00 subtotal + 4.99 shipping - 9.99 discount == 0
        let coupon = fixed_coupon(dec!(9.99), dec!(0));
        let breakdown = price_cart(&[line(dec!(5.00), 1)], Some(&coupon)).unwrap();
        assert_eq!(breakdown.total_cents, 0);
        assert!(breakdown.is_free_order());
    }

    #[test]
    fn coupon_below_minimum_order_is_rejected() {
        let coupon = fixed_coupon(dec!(5.00), dec!(25.00));
        let err = price_cart(&[line(dec!(10.00), 1)], Some(&coupon)).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn percentage_discount_applies_to_subtotal_only() {
        let coupon = percentage_coupon(dec!(50));
        let breakdown = price_cart(&[line(dec!(20.00), 1)], Some(&coupon)).unwrap();
        // 50% of 20.00 subtotal, not of subtotal + shipping
        assert_eq!(breakdown.discount_cents, 10_00);
        assert_eq!(breakdown.total_cents, 10_00 + 4_99);
    }
}
