//! Wire-level primitives shared between the reconciler's modules and its
//! tests: canonical key encoding, the event/action shape the remote store
//! reports, and a generic backoff helper. Kept free of an async runtime
//! dependency so it can be reused by synchronous unit tests without pulling
//! in `tokio`.

pub mod backoff;
pub mod event;
pub mod key;

pub use event::{
    effect_of_action,
    Effect,
    Event,
};
pub use key::{
    encode,
    EncodedKey,
    InvalidKey,
    RawKey,
};

/// Monotonically non-decreasing index attached to every store write. Strictly
/// greater means strictly later; every stored value is `> 0`.
pub type Hwm = u64;
