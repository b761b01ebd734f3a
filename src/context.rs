//! The cipher context lifecycle manager: the three-phase streaming protocol
//! (init, update, finalize) plus explicit release, threading one opaque native
//! context through a [CipherContextProxy].
//!
//! Protocol order is init → zero or more updates → finalize → release. A
//! failure from any phase leaves the context suspect; callers should skip to
//! release. One proxy/context pair must not be driven from multiple threads at
//! once: the native context carries internal mutable state (staged partial
//! blocks) with no locking of its own, so serializing operations on a single
//! context is the caller's responsibility.

use crate::alg::EncryptionAlg;
use crate::buffer::{self, ItemGuard, OutputBuffer, SecItem};
use crate::error::{Error, NativeResult, ReturnCode};
use crate::handle::{ConstPointer, Destroyed, Handle, Handled, Managed, Pointer, ViaHandle};
use crate::key::SymKey;
use crate::softoken::{self, consts, CipherContext, SymKeyObject};

use libc::{c_uint, c_ulong};
use log::{debug, trace};

use std::convert::{AsMut, AsRef};
use std::fmt;
use std::ptr;

/// Managed owner of one native cipher context.
///
/// Holds the context pointer from successful init until release; after release
/// the slot is the null sentinel and every operation on the proxy reports
/// [Error::InvalidHandle]. Dropping the proxy releases the context too, so an
/// early error return cannot leak it, but explicit
/// [release_native_resources][CipherContextProxy::release_native_resources] is
/// the documented teardown step.
pub struct CipherContextProxy {
  handle: Handle<CipherContext>,
}

/// Everything the token needs for context creation, resolved and validated by
/// [init_context_with_key_bits] before the native call.
pub(crate) struct NativeInit {
  mech: consts::CkMechanismType,
  op: consts::CkAttributeType,
  key: Pointer<SymKeyObject>,
  param: ConstPointer<SecItem>,
}

impl AsRef<Handle<CipherContext>> for CipherContextProxy {
  fn as_ref(&self) -> &Handle<CipherContext> {
    &self.handle
  }
}
impl AsMut<Handle<CipherContext>> for CipherContextProxy {
  fn as_mut(&mut self) -> &mut Handle<CipherContext> {
    &mut self.handle
  }
}
impl ViaHandle<CipherContext> for CipherContextProxy {
  fn from_handle(handle: Handle<CipherContext>) -> Self {
    Self { handle }
  }
}

impl Destroyed<CipherContext> for CipherContextProxy {
  unsafe fn destroy_raw(t: Pointer<CipherContext>) {
    softoken::destroy_context(t);
  }
}

impl Managed<CipherContext, NativeInit, Error> for CipherContextProxy {
  unsafe fn create_raw(i: NativeInit) -> Result<Pointer<CipherContext>, Error> {
    let context = softoken::create_context_by_sym_key(i.mech, i.op, i.key, i.param);
    if context.is_null() {
      Err(Error::token(
        "Failed to generate crypto context",
        softoken::port_get_error(),
      ))
    } else {
      Ok(context)
    }
  }
}

impl Handled<CipherContext, NativeInit, Error> for CipherContextProxy {}

impl CipherContextProxy {
  /// Read the native context without transferring ownership.
  pub(crate) fn context_ptr(&self) -> Result<Pointer<CipherContext>, Error> {
    let p = self.handle.get_ptr();
    if p.is_null() {
      Err(Error::InvalidHandle)
    } else {
      Ok(p)
    }
  }

  /// Destroy the native context if this proxy still owns it. Idempotent; safe
  /// to call after a failed update or finalize.
  pub fn release_native_resources(&mut self) {
    <Self as Handled<CipherContext, NativeInit, Error>>::release_native_resources(self);
  }
}

impl Drop for CipherContextProxy {
  fn drop(&mut self) {
    self.release_native_resources();
  }
}

// The native context is opaque; only the slot state is worth printing.
impl fmt::Debug for CipherContextProxy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CipherContextProxy")
      .field("handle", &self.handle.get_ptr())
      .finish()
  }
}

/// Initialize a streaming cipher context. Equivalent to
/// [init_context_with_key_bits] with no effective-key-bits override.
pub fn init_context(
  encrypt: bool,
  key: &SymKey,
  alg: EncryptionAlg,
  iv: Option<&[u8]>,
  padded: bool,
) -> Result<CipherContextProxy, Error> {
  init_context_with_key_bits(encrypt, key, alg, iv, 0, padded)
}

/// Initialize a streaming cipher context bound to (mechanism, direction, key,
/// IV parameter).
///
/// `key_bits` only matters for the RC2 family, where it overwrites the
/// effective-bits field of the mechanism parameter before context creation; it
/// is ignored for every other mechanism. All transient parameter and IV items
/// are freed on every path out of this function.
pub fn init_context_with_key_bits(
  encrypt: bool,
  key: &SymKey,
  alg: EncryptionAlg,
  iv: Option<&[u8]>,
  key_bits: u32,
  padded: bool,
) -> Result<CipherContextProxy, Error> {
  let mut mech = alg.mechanism();
  if mech == consts::CKM_INVALID_MECHANISM {
    return Err(Error::UnresolvableMechanism);
  }
  if padded {
    mech = softoken::get_pad_mechanism(mech);
  }
  let op = if encrypt {
    consts::CKA_ENCRYPT
  } else {
    consts::CKA_DECRYPT
  };
  let key = key.key_ptr()?;

  let iv_item = iv.map(|bytes| ItemGuard::wrap(unsafe { buffer::sec_item_from_bytes(bytes) }));
  let param = ItemGuard::wrap(unsafe {
    softoken::param_from_iv(
      mech,
      iv_item.as_ref().map(ItemGuard::as_ptr).unwrap_or(ptr::null()),
    )
  });
  if param.as_ptr().is_null() {
    return Err(Error::token(
      "Failed to encode mechanism parameter",
      softoken::port_get_error(),
    ));
  }

  // Set RC2 effective key length.
  if mech == consts::CKM_RC2_CBC || mech == consts::CKM_RC2_CBC_PAD {
    unsafe {
      let data = (*param.as_mut_ptr()).data as *mut consts::CkRc2CbcParams;
      let mut rc2 = ptr::read_unaligned(data);
      rc2.effective_bits = key_bits as c_ulong;
      ptr::write_unaligned(data, rc2);
    }
  }

  debug!(
    "creating cipher context: mech={:#06x} encrypt={} padded={}",
    mech, encrypt, padded
  );
  CipherContextProxy::handled_instance(NativeInit {
    mech,
    op,
    key,
    param: param.as_ptr(),
  })
}

/// Feed input through the streaming transform, advancing the native context's
/// internal state in place.
///
/// The output is sized exactly to what the cipher produced, which may be empty:
/// block ciphers stage partial blocks across calls. The staging buffer is
/// allocated at `input.len() + block_size`, the most a single update can emit.
pub fn update_context(
  proxy: &CipherContextProxy,
  input: &[u8],
  block_size: usize,
) -> Result<Vec<u8>, Error> {
  let context = proxy.context_ptr()?;

  let mut out = OutputBuffer::sized(input.len() + block_size);
  let mut outlen: c_uint = 0;
  let status: Result<(), ReturnCode> = NativeResult::call_method((), |()| unsafe {
    softoken::cipher_op(
      context,
      out.as_mut_ptr(),
      &mut outlen,
      out.capacity(),
      input.as_ptr(),
      input.len() as c_uint,
    )
  })
  .into();
  status.map_err(|rc| Error::token("Cipher context update failed", rc))?;

  trace!("cipher update: {} bytes in, {} bytes out", input.len(), outlen);
  Ok(out.into_produced(outlen as usize))
}

/// Drain the final (padded) block from the context. Produces at most
/// `block_size` bytes, possibly none.
///
/// The context survives finalization: release is a separate, explicit step, so
/// a caller that finalizes must still release afterwards.
pub fn finalize_context(
  proxy: &CipherContextProxy,
  block_size: usize,
  padded: bool,
) -> Result<Vec<u8>, Error> {
  let context = proxy.context_ptr()?;

  let mut out = OutputBuffer::sized(block_size);
  let mut outlen: c_uint = 0;
  let status: Result<(), ReturnCode> = NativeResult::call_method((), |()| unsafe {
    softoken::digest_final(context, out.as_mut_ptr(), &mut outlen, out.capacity())
  })
  .into();
  status.map_err(|rc| Error::token("Cipher context finalization failed", rc))?;

  trace!("cipher finalize: {} bytes out (padded={})", outlen, padded);
  Ok(out.into_produced(outlen as usize))
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::alg::{CipherFamily, CipherMode};
  use crate::key::KeyType;
  use crate::softoken::consts::{
    CKR_DATA_LEN_RANGE, CKR_ENCRYPTED_DATA_LEN_RANGE, CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_PARAM_INVALID, CKR_OPERATION_NOT_INITIALIZED,
  };
  use crate::softoken::{live_context_count, test_support::COUNT_GUARD};

  use proptest::prelude::*;

  fn aes_key() -> SymKey {
    SymKey::import(KeyType::Aes, &hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap())
      .unwrap()
  }

  #[test]
  fn aes_cbc_padded_scenario() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let proxy = init_context(true, &key, EncryptionAlg::AES_CBC, Some(&[0u8; 16]), true).unwrap();

    let first = update_context(&proxy, &[0x41u8; 16], 16).unwrap();
    assert!(first.is_empty() || first.len() == 16);

    let tail = finalize_context(&proxy, 16, true).unwrap();
    assert!((1..=16).contains(&tail.len()));

    let mut proxy = proxy;
    proxy.release_native_resources();
    proxy.release_native_resources(); // no-op

    assert_eq!(
      update_context(&proxy, &[0u8; 16], 16).unwrap_err(),
      Error::InvalidHandle
    );
    assert_eq!(
      finalize_context(&proxy, 16, true).unwrap_err(),
      Error::InvalidHandle
    );
  }

  #[test]
  fn nist_sp800_38a_aes128_cbc() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
    let plaintext = hex::decode(
      "6bc1bee22e409f96e93d7e117393172a\
       ae2d8a571e03ac9c9eb76fac45af8e51\
       30c81c46a35ce411e5fbc1191a0a52ef\
       f69f2445df4f9b17ad2b417be66c3710",
    )
    .unwrap();
    let expected = hex::decode(
      "7649abac8119b246cee98e9b12e9197d\
       5086cb9b507219ee95db113a917678b2\
       73bed6b8e3c1743b7116e69e22229516\
       3ff1caa1681fac09120eca307586e1a7",
    )
    .unwrap();

    let enc = init_context(true, &key, EncryptionAlg::AES_CBC, Some(&iv), false).unwrap();
    let mut ciphertext = Vec::new();
    for block in plaintext.chunks(16) {
      ciphertext.extend(update_context(&enc, block, 16).unwrap());
    }
    assert!(finalize_context(&enc, 16, false).unwrap().is_empty());
    assert_eq!(ciphertext, expected);

    let dec = init_context(false, &key, EncryptionAlg::AES_CBC, Some(&iv), false).unwrap();
    let mut recovered = update_context(&dec, &ciphertext, 16).unwrap();
    recovered.extend(finalize_context(&dec, 16, false).unwrap());
    assert_eq!(recovered, plaintext);
  }

  /// RFC 2268 known answers: with a zero IV, the first CBC block equals the
  /// ECB transform the vectors were published for.
  fn rc2_single_block(key: &[u8], key_bits: u32) -> Vec<u8> {
    let key = SymKey::import(KeyType::Rc2, key).unwrap();
    let proxy =
      init_context_with_key_bits(true, &key, EncryptionAlg::RC2_CBC, None, key_bits, false)
        .unwrap();
    let out = update_context(&proxy, &[0u8; 8], 8).unwrap();
    assert!(finalize_context(&proxy, 8, false).unwrap().is_empty());
    out
  }

  #[test]
  fn rc2_effective_bits_override() {
    let _serial = COUNT_GUARD.lock();
    let key = hex::decode("88bca90e90875a7f0f79c384627bafb2").unwrap();
    assert_eq!(
      rc2_single_block(&key, 64),
      hex::decode("1a807d272bbe5db1").unwrap()
    );
    assert_eq!(
      rc2_single_block(&hex::decode("0000000000000000").unwrap(), 63),
      hex::decode("ebb773f993278eff").unwrap()
    );
  }

  #[test]
  fn rc2_defaults_to_full_key_strength() {
    let _serial = COUNT_GUARD.lock();
    // No override: a 16-byte key runs at 128 effective bits.
    let key = hex::decode("88bca90e90875a7f0f79c384627bafb2").unwrap();
    assert_eq!(
      rc2_single_block(&key, 0),
      hex::decode("2269552ab0f85ca6").unwrap()
    );
  }

  #[test]
  fn key_bits_ignored_outside_rc2() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let with_bits =
      init_context_with_key_bits(true, &key, EncryptionAlg::AES_CBC, Some(&[0u8; 16]), 999, false)
        .unwrap();
    let without =
      init_context(true, &key, EncryptionAlg::AES_CBC, Some(&[0u8; 16]), false).unwrap();
    assert_eq!(
      update_context(&with_bits, &[0x41u8; 16], 16).unwrap(),
      update_context(&without, &[0x41u8; 16], 16).unwrap()
    );
  }

  #[test]
  fn missing_iv_means_zero_iv() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let implicit = init_context(true, &key, EncryptionAlg::AES_CBC, None, false).unwrap();
    let explicit =
      init_context(true, &key, EncryptionAlg::AES_CBC, Some(&[0u8; 16]), false).unwrap();
    assert_eq!(
      update_context(&implicit, &[0x41u8; 16], 16).unwrap(),
      update_context(&explicit, &[0x41u8; 16], 16).unwrap()
    );
  }

  #[test]
  fn unresolvable_algorithm_creates_nothing() {
    let _serial = COUNT_GUARD.lock();
    let before = live_context_count();
    let key = aes_key();
    let alg = EncryptionAlg {
      family: CipherFamily::Aes,
      mode: CipherMode::Ecb,
    };
    assert_eq!(
      init_context(true, &key, alg, None, true).unwrap_err(),
      Error::UnresolvableMechanism
    );
    assert_eq!(live_context_count(), before);
  }

  #[test]
  fn context_is_destroyed_exactly_once() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let before = live_context_count();

    // Explicit release path.
    let mut proxy = init_context(true, &key, EncryptionAlg::AES_CBC, None, true).unwrap();
    assert_eq!(live_context_count(), before + 1);
    proxy.release_native_resources();
    assert_eq!(live_context_count(), before);
    proxy.release_native_resources();
    assert_eq!(live_context_count(), before);

    // Drop path.
    {
      let _proxy = init_context(false, &key, EncryptionAlg::AES_CBC, None, true).unwrap();
      assert_eq!(live_context_count(), before + 1);
    }
    assert_eq!(live_context_count(), before);

    // Finalize-then-release: finalize must not destroy.
    let mut proxy = init_context(true, &key, EncryptionAlg::AES_CBC, None, true).unwrap();
    finalize_context(&proxy, 16, true).unwrap();
    assert_eq!(live_context_count(), before + 1);
    proxy.release_native_resources();
    assert_eq!(live_context_count(), before);
  }

  #[test]
  fn failed_init_leaks_nothing() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let before = live_context_count();
    // AES key driven through a DES3 mechanism.
    let err = init_context(true, &key, EncryptionAlg::DES3_CBC, None, true).unwrap_err();
    assert_eq!(
      err,
      Error::Token("Failed to generate crypto context", CKR_KEY_TYPE_INCONSISTENT)
    );
    assert_eq!(live_context_count(), before);
  }

  #[test]
  fn wrong_iv_length_rejected_before_creation() {
    let _serial = COUNT_GUARD.lock();
    let before = live_context_count();
    let aes = aes_key();
    let rc2 = SymKey::import(KeyType::Rc2, &[0x88u8; 16]).unwrap();
    assert_eq!(
      init_context(true, &aes, EncryptionAlg::AES_CBC, Some(&[0u8; 8]), true).unwrap_err(),
      Error::Token("Failed to encode mechanism parameter", CKR_MECHANISM_PARAM_INVALID)
    );
    // The RC2 parameter struct has room for exactly 8 IV bytes; anything else
    // is rejected rather than zero-padded or truncated.
    for iv in [&[0u8; 4][..], &[0u8; 16][..]] {
      assert_eq!(
        init_context(true, &rc2, EncryptionAlg::RC2_CBC, Some(iv), false).unwrap_err(),
        Error::Token("Failed to encode mechanism parameter", CKR_MECHANISM_PARAM_INVALID)
      );
    }
    assert_eq!(live_context_count(), before);
  }

  #[test]
  fn released_key_fails_resolution() {
    let mut key = SymKey::import(KeyType::Aes, &[0u8; 16]).unwrap();
    key.release_native_resources();
    assert_eq!(
      init_context(true, &key, EncryptionAlg::AES_CBC, None, true).unwrap_err(),
      Error::InvalidKey
    );
  }

  #[test]
  fn update_stages_partial_blocks() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let proxy = init_context(true, &key, EncryptionAlg::AES_CBC, None, true).unwrap();
    assert!(update_context(&proxy, &[0x41u8; 8], 16).unwrap().is_empty());
    assert_eq!(update_context(&proxy, &[0x41u8; 8], 16).unwrap().len(), 16);
  }

  #[test]
  fn unpadded_rejects_ragged_input() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();

    let enc = init_context(true, &key, EncryptionAlg::AES_CBC, None, false).unwrap();
    update_context(&enc, &[0u8; 10], 16).unwrap();
    assert_eq!(
      finalize_context(&enc, 16, false).unwrap_err(),
      Error::Token("Cipher context finalization failed", CKR_DATA_LEN_RANGE)
    );

    let dec = init_context(false, &key, EncryptionAlg::AES_CBC, None, false).unwrap();
    update_context(&dec, &[0u8; 10], 16).unwrap();
    assert_eq!(
      finalize_context(&dec, 16, false).unwrap_err(),
      Error::Token(
        "Cipher context finalization failed",
        CKR_ENCRYPTED_DATA_LEN_RANGE
      )
    );
  }

  #[test]
  fn finalize_is_terminal() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let proxy = init_context(true, &key, EncryptionAlg::AES_CBC, None, true).unwrap();
    finalize_context(&proxy, 16, true).unwrap();
    assert_eq!(
      finalize_context(&proxy, 16, true).unwrap_err(),
      Error::Token("Cipher context finalization failed", CKR_OPERATION_NOT_INITIALIZED)
    );
    assert_eq!(
      update_context(&proxy, &[0u8; 16], 16).unwrap_err(),
      Error::Token("Cipher context update failed", CKR_OPERATION_NOT_INITIALIZED)
    );
  }

  #[test]
  fn proxy_debug_shows_the_slot_state() {
    let _serial = COUNT_GUARD.lock();
    let key = aes_key();
    let mut proxy = init_context(true, &key, EncryptionAlg::AES_CBC, None, true).unwrap();
    assert!(format!("{:?}", proxy).contains("CipherContextProxy"));
    proxy.release_native_resources();
    assert!(format!("{:?}", proxy).contains("0x0"));
  }

  #[test]
  fn des_cbc_padded_round_trip() {
    let _serial = COUNT_GUARD.lock();
    let key = SymKey::import(KeyType::Des, &[0x13u8; 8]).unwrap();
    let iv = [0x2au8; 8];
    let message = b"single DES, deliberately unaligned";

    let enc = init_context(true, &key, EncryptionAlg::DES_CBC, Some(&iv), true).unwrap();
    let mut ciphertext = update_context(&enc, message, 8).unwrap();
    ciphertext.extend(finalize_context(&enc, 8, true).unwrap());
    assert_eq!(ciphertext.len() % 8, 0);
    assert!(ciphertext.len() > message.len());

    let dec = init_context(false, &key, EncryptionAlg::DES_CBC, Some(&iv), true).unwrap();
    let mut recovered = update_context(&dec, &ciphertext, 8).unwrap();
    recovered.extend(finalize_context(&dec, 8, true).unwrap());
    assert_eq!(recovered, message);
  }

  #[test]
  fn des3_cbc_padded_round_trip() {
    let _serial = COUNT_GUARD.lock();
    let key = SymKey::import(KeyType::Des3, &[0x53u8; 24]).unwrap();
    let iv = [0x1fu8; 8];
    let message = b"triple-DES payload, deliberately unaligned";

    let enc = init_context(true, &key, EncryptionAlg::DES3_CBC, Some(&iv), true).unwrap();
    let mut ciphertext = update_context(&enc, message, 8).unwrap();
    ciphertext.extend(finalize_context(&enc, 8, true).unwrap());
    assert_eq!(ciphertext.len() % 8, 0);
    assert!(ciphertext.len() > message.len());

    let dec = init_context(false, &key, EncryptionAlg::DES3_CBC, Some(&iv), true).unwrap();
    let mut recovered = update_context(&dec, &ciphertext, 8).unwrap();
    recovered.extend(finalize_context(&dec, 8, true).unwrap());
    assert_eq!(recovered, message);
  }

  proptest! {
    #[test]
    fn aes_cbc_padded_round_trip_in_chunks(
      key_bytes in proptest::collection::vec(any::<u8>(), 16),
      iv in proptest::collection::vec(any::<u8>(), 16),
      message in proptest::collection::vec(any::<u8>(), 0..256),
      chunk in 1usize..48,
    ) {
      let _serial = COUNT_GUARD.lock();
      let key = SymKey::import(KeyType::Aes, &key_bytes).unwrap();

      let enc = init_context(true, &key, EncryptionAlg::AES_CBC, Some(&iv), true).unwrap();
      let mut ciphertext = Vec::new();
      for piece in message.chunks(chunk) {
        let out = update_context(&enc, piece, 16).unwrap();
        prop_assert!(out.len() <= piece.len() + 16);
        ciphertext.extend(out);
      }
      let tail = finalize_context(&enc, 16, true).unwrap();
      prop_assert!(tail.len() <= 16);
      ciphertext.extend(tail);
      prop_assert_eq!(ciphertext.len() % 16, 0);

      let dec = init_context(false, &key, EncryptionAlg::AES_CBC, Some(&iv), true).unwrap();
      let mut recovered = Vec::new();
      for piece in ciphertext.chunks(chunk) {
        let out = update_context(&dec, piece, 16).unwrap();
        prop_assert!(out.len() <= piece.len() + 16);
        recovered.extend(out);
      }
      let tail = finalize_context(&dec, 16, true).unwrap();
      prop_assert!(tail.len() <= 16);
      recovered.extend(tail);
      prop_assert_eq!(recovered, message);
    }
  }
}
