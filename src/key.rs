//! Managed symmetric key objects: thin owners of opaque token key handles.

use crate::error::Error;
use crate::handle::{Destroyed, Handle, Handled, Managed, Pointer, ViaHandle};
use crate::softoken::{self, consts, SymKeyObject};

use std::convert::{AsMut, AsRef};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
  Aes,
  Des,
  Des3,
  Rc2,
}

impl KeyType {
  pub(crate) fn as_ck(self) -> consts::CkKeyType {
    match self {
      Self::Aes => consts::CKK_AES,
      Self::Des => consts::CKK_DES,
      Self::Des3 => consts::CKK_DES3,
      Self::Rc2 => consts::CKK_RC2,
    }
  }
}

/// A symmetric key living in the token. The managed object owns the native key
/// exclusively; dropping it (or calling
/// [release_native_resources][Handled::release_native_resources]) frees and
/// zeroizes the token-side material.
pub struct SymKey {
  handle: Handle<SymKeyObject>,
}

impl SymKey {
  pub fn import(key_type: KeyType, material: &[u8]) -> Result<Self, Error> {
    <Self as Handled<SymKeyObject, (KeyType, &[u8]), Error>>::handled_instance((key_type, material))
  }

  /// Resolve this key object to its native handle. Fails if the key has
  /// already released its token object.
  pub(crate) fn key_ptr(&self) -> Result<Pointer<SymKeyObject>, Error> {
    let p = self.handle.get_ptr();
    if p.is_null() {
      Err(Error::InvalidKey)
    } else {
      Ok(p)
    }
  }
}

impl AsRef<Handle<SymKeyObject>> for SymKey {
  fn as_ref(&self) -> &Handle<SymKeyObject> {
    &self.handle
  }
}
impl AsMut<Handle<SymKeyObject>> for SymKey {
  fn as_mut(&mut self) -> &mut Handle<SymKeyObject> {
    &mut self.handle
  }
}
impl ViaHandle<SymKeyObject> for SymKey {
  fn from_handle(handle: Handle<SymKeyObject>) -> Self {
    Self { handle }
  }
}

impl Destroyed<SymKeyObject> for SymKey {
  unsafe fn destroy_raw(t: Pointer<SymKeyObject>) {
    softoken::free_sym_key(t);
  }
}

impl<'a> Managed<SymKeyObject, (KeyType, &'a [u8]), Error> for SymKey {
  unsafe fn create_raw(i: (KeyType, &'a [u8])) -> Result<Pointer<SymKeyObject>, Error> {
    let (key_type, material) = i;
    let key = softoken::import_sym_key(key_type.as_ck(), material);
    if key.is_null() {
      Err(Error::token(
        "Failed to import symmetric key",
        softoken::port_get_error(),
      ))
    } else {
      Ok(key)
    }
  }
}

impl<'a> Handled<SymKeyObject, (KeyType, &'a [u8]), Error> for SymKey {}

impl Drop for SymKey {
  fn drop(&mut self) {
    self.release_native_resources();
  }
}

// Never prints key material, only the slot state.
impl fmt::Debug for SymKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SymKey")
      .field("handle", &self.handle.get_ptr())
      .finish()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::softoken::consts::CKR_KEY_SIZE_RANGE;

  #[test]
  fn import_and_resolve() {
    let key = SymKey::import(KeyType::Aes, &[0u8; 16]).unwrap();
    assert!(key.key_ptr().is_ok());
  }

  #[test]
  fn import_rejects_short_material() {
    assert_eq!(
      SymKey::import(KeyType::Des3, &[0u8; 8]).unwrap_err(),
      Error::Token("Failed to import symmetric key", CKR_KEY_SIZE_RANGE)
    );
  }

  #[test]
  fn debug_shows_only_the_slot() {
    let key = SymKey::import(KeyType::Aes, &[0x2bu8; 16]).unwrap();
    let rendered = format!("{:?}", key);
    assert!(rendered.contains("SymKey"));
    assert!(rendered.contains("handle"));
  }

  #[test]
  fn released_key_no_longer_resolves() {
    let mut key = SymKey::import(KeyType::Rc2, &[0x88u8]).unwrap();
    key.release_native_resources();
    assert_eq!(key.key_ptr().unwrap_err(), Error::InvalidKey);
    // Idempotent.
    key.release_native_resources();
  }
}
