//! Exchange connectivity: request signing, signed REST, market streams
//! and a paper exchange.

mod paper;
mod rest;
mod retry;
mod signer;
mod stream;

pub use paper::{PaperConfig, PaperExchange};
pub use rest::{NeutralDialect, NeutralPaths, RestCall, RestDialect, RestExchange, SignedRestClient};
pub use retry::{retry, RetryPolicy};
pub use signer::{
    encode_query, Clock, FixedClock, RequestSigner, SignatureHeaders, SignedHeaders, SystemClock,
    DEFAULT_RECV_WINDOW_MS,
};
pub use stream::{
    MarketStream, NeutralCodec, StreamCodec, StreamConfig, StreamState, StreamSummary, Subscription,
};
