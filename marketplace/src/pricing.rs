// marketplace/src/pricing.rs

//! Fee arithmetic. Pure; amounts are integer cents and percentages are basis
//! points, rounded half-up per item.
//!
//! Per item: `buyer_fee = subtotal * buyer_bps`, `vendor_fee = subtotal *
//! vendor_bps`, `platform_fee = buyer_fee + vendor_fee`, `payout = subtotal -
//! vendor_fee`. Order totals are sums of item values, and the flat fee is
//! added once on top, so `sum(payout) + platform_fee == buyer_total - flat_fee`
//! holds exactly.

use crate::config::FeeSchedule;
use crate::errors::{ErrorCode, Rejection};
use crate::models::Vertical;
use chrono::NaiveDate;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLine {
  pub unit_price_cents: i64,
  pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPricing {
  pub subtotal_cents: i64,
  pub buyer_fee_cents: i64,
  pub vendor_fee_cents: i64,
  pub platform_fee_cents: i64,
  pub vendor_payout_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPricing {
  pub subtotal_cents: i64,
  pub buyer_fee_cents: i64,
  pub platform_fee_cents: i64,
  pub flat_fee_cents: i64,
  /// Subtotal, buyer fees and the flat fee. Excludes any tip.
  pub buyer_total_cents: i64,
  pub items: Vec<ItemPricing>,
}

impl OrderPricing {
  pub fn vendor_payouts(&self) -> impl Iterator<Item = i64> + '_ {
    self.items.iter().map(|i| i.vendor_payout_cents)
  }
}

/// `amount * bps / 10_000`, half-up.
pub fn apply_bps(amount_cents: i64, bps: i64) -> i64 {
  (amount_cents * bps + 5_000).div_euclid(10_000)
}

pub fn price_item(line: PriceLine, fees: &FeeSchedule) -> ItemPricing {
  let subtotal_cents = line.unit_price_cents * i64::from(line.quantity);
  let buyer_fee_cents = apply_bps(subtotal_cents, fees.buyer_fee_bps);
  let vendor_fee_cents = apply_bps(subtotal_cents, fees.vendor_fee_bps);
  ItemPricing {
    subtotal_cents,
    buyer_fee_cents,
    vendor_fee_cents,
    platform_fee_cents: buyer_fee_cents + vendor_fee_cents,
    vendor_payout_cents: subtotal_cents - vendor_fee_cents,
  }
}

/// Prices `lines` and adds the flat fee once, even for an empty list.
pub fn price_order(lines: &[PriceLine], fees: &FeeSchedule) -> OrderPricing {
  let items: Vec<ItemPricing> = lines.iter().map(|l| price_item(*l, fees)).collect();
  let subtotal_cents = items.iter().map(|i| i.subtotal_cents).sum::<i64>();
  let buyer_fee_cents = items.iter().map(|i| i.buyer_fee_cents).sum::<i64>();
  let platform_fee_cents = items.iter().map(|i| i.platform_fee_cents).sum::<i64>();
  OrderPricing {
    subtotal_cents,
    buyer_fee_cents,
    platform_fee_cents,
    flat_fee_cents: fees.flat_fee_cents,
    buyer_total_cents: subtotal_cents + buyer_fee_cents + fees.flat_fee_cents,
    items,
  }
}

/// Minimum order value applies to the subtotal before any fee.
pub fn check_minimum(subtotal_cents: i64, minimum_cents: i64) -> Result<(), Rejection> {
  if subtotal_cents < minimum_cents {
    return Err(Rejection::below_minimum(minimum_cents, subtotal_cents));
  }
  Ok(())
}

/// Resolves the tip in cents. An explicit amount wins over a percentage of the
/// subtotal.
pub fn resolve_tip(
  subtotal_cents: i64,
  tip_amount_cents: Option<i64>,
  tip_percentage: Option<f64>,
  tips_enabled: bool,
) -> Result<i64, Rejection> {
  let requested = tip_amount_cents.is_some_and(|a| a != 0) || tip_percentage.is_some_and(|p| p != 0.0);
  if !requested {
    return Ok(0);
  }
  if !tips_enabled {
    return Err(Rejection::new(ErrorCode::InvalidTip, "Tips are not accepted for this market."));
  }
  if let Some(amount) = tip_amount_cents.filter(|a| *a != 0) {
    if amount < 0 {
      return Err(Rejection::new(ErrorCode::InvalidTip, "Tip cannot be negative."));
    }
    return Ok(amount);
  }
  match tip_percentage {
    Some(pct) if pct.is_finite() && (0.0..=100.0).contains(&pct) => {
      let pct_bps = (pct * 100.0).round() as i64;
      Ok(apply_bps(subtotal_cents, pct_bps))
    }
    _ => Err(Rejection::new(
      ErrorCode::InvalidTip,
      "Tip percentage must be between 0 and 100.",
    )),
  }
}

/// `<FM|FT>-<YYMMDD>-<first 6 hex of the order id>`.
pub fn order_number(vertical: Vertical, date: NaiveDate, order_id: Uuid) -> String {
  let hex = order_id.simple().to_string();
  format!(
    "{}-{}-{}",
    vertical.order_prefix(),
    date.format("%y%m%d"),
    hex[..6].to_uppercase()
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fees() -> FeeSchedule {
    FeeSchedule {
      buyer_fee_bps: 600,
      vendor_fee_bps: 400,
      flat_fee_cents: 50,
    }
  }

  #[test]
  fn worked_example_two_ten_dollar_items() {
    let pricing = price_order(
      &[PriceLine {
        unit_price_cents: 1000,
        quantity: 2,
      }],
      &fees(),
    );
    assert_eq!(pricing.subtotal_cents, 2000);
    assert_eq!(pricing.platform_fee_cents, 200);
    assert_eq!(pricing.buyer_fee_cents, 120);
    assert_eq!(pricing.buyer_total_cents, 2170);
    assert_eq!(pricing.vendor_payouts().collect::<Vec<_>>(), vec![1920]);
  }

  #[test]
  fn payouts_plus_platform_fee_equal_total_less_flat() {
    let carts: Vec<Vec<PriceLine>> = vec![
      vec![],
      vec![PriceLine {
        unit_price_cents: 333,
        quantity: 1,
      }],
      vec![
        PriceLine {
          unit_price_cents: 199,
          quantity: 3,
        },
        PriceLine {
          unit_price_cents: 1249,
          quantity: 7,
        },
        PriceLine {
          unit_price_cents: 5,
          quantity: 1,
        },
      ],
      (1..40)
        .map(|i| PriceLine {
          unit_price_cents: i * 37 + 1,
          quantity: (i % 4 + 1) as i32,
        })
        .collect(),
    ];
    for lines in carts {
      let p = price_order(&lines, &fees());
      let payouts: i64 = p.vendor_payouts().sum();
      assert_eq!(payouts + p.platform_fee_cents, p.buyer_total_cents - p.flat_fee_cents);
      assert_eq!(p.flat_fee_cents, 50);
    }
  }

  #[test]
  fn flat_fee_is_not_multiplied_by_items() {
    let one = price_order(
      &[PriceLine {
        unit_price_cents: 1000,
        quantity: 1,
      }],
      &fees(),
    );
    let five = price_order(
      &vec![
        PriceLine {
          unit_price_cents: 200,
          quantity: 1,
        };
        5
      ],
      &fees(),
    );
    assert_eq!(one.subtotal_cents, five.subtotal_cents);
    assert_eq!(one.buyer_total_cents, five.buyer_total_cents);
  }

  #[test]
  fn rounding_is_half_up() {
    assert_eq!(apply_bps(25, 600), 2); // 1.5 -> 2
    assert_eq!(apply_bps(24, 600), 1); // 1.44 -> 1
    assert_eq!(apply_bps(0, 600), 0);
  }

  #[test]
  fn minimum_reports_shortfall() {
    assert!(check_minimum(1000, 1000).is_ok());
    let r = check_minimum(650, 1000).unwrap_err();
    assert_eq!(r.code, ErrorCode::BelowMinimum);
    assert_eq!(r.shortfall_cents, Some(350));
  }

  #[test]
  fn tip_amount_wins_over_percentage() {
    assert_eq!(resolve_tip(2000, Some(300), Some(10.0), true), Ok(300));
    assert_eq!(resolve_tip(2000, None, Some(15.0), true), Ok(300));
    assert_eq!(resolve_tip(1999, None, Some(12.5), true), Ok(250));
    assert_eq!(resolve_tip(2000, None, None, false), Ok(0));
  }

  #[test]
  fn tip_rejections() {
    let disabled = resolve_tip(2000, Some(100), None, false).unwrap_err();
    assert_eq!(disabled.code, ErrorCode::InvalidTip);
    assert_eq!(resolve_tip(2000, Some(-5), None, true).unwrap_err().code, ErrorCode::InvalidTip);
    assert_eq!(resolve_tip(2000, None, Some(120.0), true).unwrap_err().code, ErrorCode::InvalidTip);
  }

  #[test]
  fn order_number_shape() {
    let id = Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000000").unwrap();
    let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
    assert_eq!(order_number(Vertical::FarmersMarket, date, id), "FM-261016-A1B2C3");
    assert_eq!(order_number(Vertical::FoodTrucks, date, id), "FT-261016-A1B2C3");
  }
}
