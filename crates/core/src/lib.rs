pub mod error;
pub mod event;
pub mod expression;
pub mod group;
pub mod throttle;
pub mod time;

pub use error::{EventError, ExpressionError, ThrottleError};
pub use event::{EVENT_TYPE_EVENT, EVENT_TYPE_METRIC, Event, EventMetadata};
pub use expression::{ComparisonEvaluator, ExpressionEvaluator};
pub use group::{GroupKey, GroupState};
pub use throttle::{MAX_EVENTS_PER_SECOND, TokenBucket};
pub use time::{format_timestamp, parse_timestamp};
