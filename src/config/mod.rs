pub mod schema;

pub use schema::{
    Config, FleetConfig, NotificationsConfig, PlatformConfig, RedemptionConfig,
    ReliabilityConfig, RenewalConfig,
};
