//! Failure taxonomy for the managed cipher surface, plus the adapter that turns
//! soft-token status/last-error pairs into [Result]s.

use crate::softoken::{self, SecStatus};

use displaydoc::Display;
use thiserror::Error;

/// `CK_RV`: the provider-native return code attached to token failures.
pub type ReturnCode = libc::c_ulong;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum Error {
  /// Unable to resolve algorithm to PKCS #11 mechanism
  UnresolvableMechanism,
  /// Symmetric key is not backed by a live token object
  InvalidKey,
  /// Out of memory in the token runtime
  NoMemory,
  /// {0} (CKR 0x{1:04x})
  Token(&'static str, ReturnCode),
  /// Cipher context proxy does not hold a live native context
  InvalidHandle,
}

impl Error {
  /// Categorize a native failure: host-memory exhaustion is its own class,
  /// everything else keeps the provider code for diagnostics.
  pub(crate) fn token(what: &'static str, rc: ReturnCode) -> Self {
    match rc {
      softoken::consts::CKR_HOST_MEMORY => Self::NoMemory,
      rc => Self::Token(what, rc),
    }
  }
}

/// Outcome of one native call, before categorization. The token reports success
/// or failure out-of-band of its outputs; on failure the specific code is
/// fetched from the thread-local error slot, mirroring the provider's
/// `PORT_GetError` convention.
pub enum NativeResult<T> {
  Success(T),
  Failure(ReturnCode),
}

impl<T: Copy> NativeResult<T> {
  pub fn call_method<F: FnOnce(T) -> SecStatus>(t: T, f: F) -> Self {
    match f(t) {
      SecStatus::Success => Self::Success(t),
      SecStatus::Failure => Self::Failure(softoken::port_get_error()),
    }
  }
}

impl<T> From<NativeResult<T>> for Result<T, ReturnCode> {
  fn from(other: NativeResult<T>) -> Self {
    match other {
      NativeResult::Success(x) => Ok(x),
      NativeResult::Failure(rc) => Err(rc),
    }
  }
}
