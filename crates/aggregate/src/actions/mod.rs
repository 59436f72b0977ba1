//! The built-in aggregate actions.

pub mod append;
pub mod count;
pub mod histogram;
pub mod percent_sampler;
pub mod put_all;
pub mod rate_limiter;
pub mod remove_duplicates;
pub mod tail_sampler;

pub use append::{AppendAction, AppendConfig};
pub use count::{CountAction, CountConfig};
pub use histogram::{HistogramAction, HistogramConfig};
pub use percent_sampler::{PercentSamplerAction, PercentSamplerConfig};
pub use put_all::PutAllAction;
pub use rate_limiter::{RateLimiterAction, RateLimiterConfig, RateLimiterMode};
pub use remove_duplicates::RemoveDuplicatesAction;
pub use tail_sampler::{TailSamplerAction, TailSamplerConfig};
