//! Time-bound signed connection URLs.
//!
//! The HMAC key is the SHA-256 digest of the device secret. The secret itself
//! never appears in a URL.

pub mod signer;

pub use signer::{
    SignError, normalize_endpoint, redact_signature, signature, signed_connection_url,
    signed_connection_url_at, verify_signature,
};
