//! Cryptographic primitives and credential hygiene.
//!
//! Everything that touches raw secret bytes lives here: AEAD encryption for
//! tokens at rest, password-based key derivation, secure random generation,
//! token masking for logs and status output, and constant-time comparison
//! for OAuth state values.

pub mod crypto;
pub mod masking;

pub use crypto::{decrypt, derive_key, encrypt, generate_secure_token};
pub use masking::{CredentialRedactor, constant_time_eq, mask_token};
