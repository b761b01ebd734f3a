//! Managed symmetric-cipher bindings over a software PKCS #11 token.
//!
//! The token side ([softoken]) speaks raw pointers, `SECItem`-style buffers, and
//! out-of-band error codes; everything above it wraps those resources in
//! exclusively owning proxy objects ([key::SymKey], [context::CipherContextProxy])
//! whose handles are destroyed exactly once, on explicit release or on drop.
//! [context] drives the streaming protocol itself: initialize a context against
//! a key, algorithm, and IV, push data through it in arbitrary chunks, then
//! finalize and release.
//!
//! ```
//! use softoken_cipher::{init_context, update_context, finalize_context};
//! use softoken_cipher::{EncryptionAlg, KeyType, SymKey};
//!
//! # fn main() -> Result<(), softoken_cipher::Error> {
//! let key = SymKey::import(KeyType::Aes, &[0x2b; 16])?;
//! let block = EncryptionAlg::AES_CBC.block_len();
//!
//! let ctx = init_context(true, &key, EncryptionAlg::AES_CBC, Some(&[0; 16]), true)?;
//! let mut ciphertext = update_context(&ctx, b"attack at dawn", block)?;
//! ciphertext.extend(finalize_context(&ctx, block, true)?);
//! assert_eq!(ciphertext.len() % block, 0);
//! # Ok(())
//! # }
//! ```

// Fail on warnings.
#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Avoid docstrings on every unsafe method.
#![allow(clippy::missing_safety_doc)]

pub mod alg;
pub mod buffer;
pub mod context;
pub mod error;
pub mod handle;
pub mod key;
pub mod softoken;

pub use alg::{CipherFamily, CipherMode, EncryptionAlg};
pub use context::{
  finalize_context, init_context, init_context_with_key_bits, update_context, CipherContextProxy,
};
pub use error::Error;
pub use key::{KeyType, SymKey};
