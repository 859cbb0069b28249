//! # loom-shared
//!
//! Types shared by every loom crate: keys and identities, the crypto
//! primitives used for blocks and sealed envelopes, typed identifiers, the
//! signed wire protocol, the thread block codec and cafe session tokens.

pub mod block;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod types;

pub use error::{CodecError, CryptoError, IdentityError, ProtocolError, TokenError};
pub use identity::{Account, Identity};
pub use types::{Address, ContentId, PeerId, ThreadId};
