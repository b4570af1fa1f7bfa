// marketplace/src/models/mod.rs

//! Rows the pipelines read and write. The schema itself is owned elsewhere;
//! these mirror the columns this service touches.

pub mod cart;
pub mod listing;
pub mod market_box;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod tier;

pub use cart::{CartItemInput, CheckoutRequest, MarketBoxItemInput, SessionBoxItem};
pub use listing::{
  AvailabilityWindow, CartSelection, Listing, ListingMarket, ListingStatus, MarketSchedule, MarketType,
  VerticalSettings,
};
pub use market_box::{
  MarketBoxOffering, MarketBoxPickup, MarketBoxSubscription, NewMarketBoxSubscription, PickupStatus,
  SubscriptionStatus,
};
pub use order::{Order, OrderStatus, Vertical};
pub use order_item::{ItemStatus, OrderItem, PickupSnapshot};
pub use payment::{Payment, PaymentStatus};
pub use tier::{BillingCycle, TierAccount, TierRecord, TierStatus};
