//! Channel-points redemptions turned into validated moderation commands.

pub mod classify;
pub mod dispatcher;
pub mod policy;

pub use classify::{is_timeout_redemption, sanitize_target};
pub use dispatcher::{PolicySettings, RedemptionDispatcher, StartOutcome, SubscriptionRegistry};
pub use policy::{RedemptionEvent, RedemptionOutcome, evaluate};
