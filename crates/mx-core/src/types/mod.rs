//! Core data types: quotes, trade ticks, candles, resolutions and topic naming.

pub mod enums;
pub mod market_data;
pub mod topic;

pub use enums::*;
pub use market_data::*;
pub use topic::*;
