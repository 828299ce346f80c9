//! Courier Core: Hybrid Logical Clock, error taxonomy, retry policy, topic patterns, codecs.

pub mod codec;
pub mod error;
pub mod headers;
pub mod hlc;
pub mod retry;
pub mod topic;
pub mod traits;
pub mod types;

pub use codec::{CodecError, EmptyCodec, JsonCodec, MsgPackCodec, PayloadCodec, RawCodec};
pub use error::{ErrorKind, ProtocolError};
pub use hlc::{ClockSource, HlcConfig, HlcError, ManualClock, SystemClock, Timestamp, HLC};
pub use retry::{ExponentialBackoff, NoRetry, RetryDecision, RetryOptions, RetryPolicy};
pub use topic::{TopicPattern, TopicTokens};
pub use traits::{PubSubTransport, Subscription};
pub use types::{AckToken, FormatIndicator, InboundMessage, ProtocolVersion, PublishProperties};
