//! Account configuration resolution.
//!
//! Normalizes the raw channel configuration (legacy single-account or
//! multi-account shapes) into typed, defaulted [`AccountDescriptor`]s.
//! Resolution never fails: malformed numbers fall back to defaults and a
//! missing account resolves to `None`.

pub mod descriptor;
pub mod resolver;

pub use descriptor::AccountDescriptor;
pub use resolver::{DEFAULT_ACCOUNT_ID, list_account_ids, resolve_account};
