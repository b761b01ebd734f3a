//! The native-style cryptographic provider: a software token exposing opaque,
//! manually managed cipher contexts behind a raw-pointer, return-code surface.
//!
//! Everything above this module treats these functions as a foreign boundary:
//! resources come back as raw pointers that must be destroyed exactly once, and
//! failures are reported out-of-band through a thread-local error slot fetched
//! with [port_get_error]. The block ciphers themselves are delegated to the
//! RustCrypto crates; this module only implements mechanism plumbing.

pub mod consts;
pub(crate) mod engine;

use crate::buffer::{self, SecItem};
use crate::error::ReturnCode;
use crate::handle::{ConstPointer, Pointer};

use consts::*;
use engine::StreamEngine;

use aes::{Aes128, Aes192, Aes256};
use des::{Des, TdesEde3};
use libc::c_uint;
use zeroize::Zeroizing;

use std::cell::Cell;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `SECStatus`: the provider reports success or failure; the specific error
/// code goes to the thread-local slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecStatus {
  Success,
  Failure,
}

std::thread_local! {
  static LAST_ERROR: Cell<ReturnCode> = Cell::new(CKR_OK);
}

fn set_error(rc: ReturnCode) {
  LAST_ERROR.with(|slot| slot.set(rc));
}

/// Fetch the code of the most recent failure on this thread.
pub fn port_get_error() -> ReturnCode {
  LAST_ERROR.with(|slot| slot.get())
}

/// Count of cipher contexts currently alive in the token. Creation increments,
/// destruction decrements; a caller that balances them leaves this unchanged.
pub fn live_context_count() -> usize {
  LIVE_CONTEXTS.load(Ordering::SeqCst)
}

static LIVE_CONTEXTS: AtomicUsize = AtomicUsize::new(0);

/// Opaque symmetric key object. Only the token looks inside.
pub struct SymKeyObject {
  key_type: CkKeyType,
  material: Zeroizing<Vec<u8>>,
}

/// Opaque stateful cipher context. Mutated in place by [cipher_op] and
/// [digest_final]; destroyed exactly once by [destroy_context].
pub struct CipherContext {
  engine: Box<dyn StreamEngine>,
}

fn key_len_valid(key_type: CkKeyType, len: usize) -> bool {
  match key_type {
    CKK_AES => matches!(len, 16 | 24 | 32),
    CKK_DES => len == 8,
    CKK_DES3 => len == 24,
    CKK_RC2 => (1..=128).contains(&len),
    _ => false,
  }
}

/// Import raw key material as a token key object. Returns null (with the error
/// slot set) when the material does not fit the key type.
pub unsafe fn import_sym_key(key_type: CkKeyType, material: &[u8]) -> Pointer<SymKeyObject> {
  if !key_len_valid(key_type, material.len()) {
    set_error(CKR_KEY_SIZE_RANGE);
    return ptr::null_mut();
  }
  Box::into_raw(Box::new(SymKeyObject {
    key_type,
    material: Zeroizing::new(material.to_vec()),
  }))
}

/// Destroy a token key object. Null-safe; key material is zeroized on drop.
pub unsafe fn free_sym_key(key: Pointer<SymKeyObject>) {
  if !key.is_null() {
    drop(Box::from_raw(key));
  }
}

/// Map a base mechanism to its block-padded variant; identity for mechanisms
/// with no padded form.
pub fn get_pad_mechanism(mech: CkMechanismType) -> CkMechanismType {
  match mech {
    CKM_AES_CBC => CKM_AES_CBC_PAD,
    CKM_DES_CBC => CKM_DES_CBC_PAD,
    CKM_DES3_CBC => CKM_DES3_CBC_PAD,
    CKM_RC2_CBC => CKM_RC2_CBC_PAD,
    other => other,
  }
}

fn iv_len_for_mech(mech: CkMechanismType) -> usize {
  match mech {
    CKM_AES_CBC | CKM_AES_CBC_PAD => 16,
    CKM_DES_CBC | CKM_DES_CBC_PAD | CKM_DES3_CBC | CKM_DES3_CBC_PAD | CKM_RC2_CBC
    | CKM_RC2_CBC_PAD => 8,
    _ => 0,
  }
}

fn key_type_for_mech(mech: CkMechanismType) -> Result<CkKeyType, ReturnCode> {
  match mech {
    CKM_AES_CBC | CKM_AES_CBC_PAD => Ok(CKK_AES),
    CKM_DES_CBC | CKM_DES_CBC_PAD => Ok(CKK_DES),
    CKM_DES3_CBC | CKM_DES3_CBC_PAD => Ok(CKK_DES3),
    CKM_RC2_CBC | CKM_RC2_CBC_PAD => Ok(CKK_RC2),
    _ => Err(CKR_MECHANISM_INVALID),
  }
}

fn is_pad_mech(mech: CkMechanismType) -> bool {
  matches!(
    mech,
    CKM_AES_CBC_PAD | CKM_DES_CBC_PAD | CKM_DES3_CBC_PAD | CKM_RC2_CBC_PAD
  )
}

/// Build the mechanism parameter item from an optional IV item.
///
/// With no IV the parameter is present but zero-valued: a zero IV of mechanism
/// length, or for the RC2 family a zeroed [CkRc2CbcParams] whose effective-bits
/// field the caller patches before context creation. A present IV must match
/// the mechanism block length; otherwise the error slot is set to
/// `CKR_MECHANISM_PARAM_INVALID` and null is returned. The caller owns the
/// returned item and must free it on every path.
pub unsafe fn param_from_iv(mech: CkMechanismType, iv: ConstPointer<SecItem>) -> Pointer<SecItem> {
  let iv_bytes = buffer::sec_item_bytes(iv);
  if !iv_bytes.is_empty() && iv_bytes.len() != iv_len_for_mech(mech) {
    set_error(CKR_MECHANISM_PARAM_INVALID);
    return ptr::null_mut();
  }
  match mech {
    CKM_RC2_CBC | CKM_RC2_CBC_PAD => {
      let mut params = CkRc2CbcParams {
        effective_bits: 0,
        iv: [0u8; 8],
      };
      params.iv[..iv_bytes.len()].copy_from_slice(iv_bytes);
      // Parameter items are plain byte buffers; struct access goes through
      // unaligned reads and writes.
      let mut raw = vec![0u8; mem::size_of::<CkRc2CbcParams>()];
      ptr::write_unaligned(raw.as_mut_ptr() as *mut CkRc2CbcParams, params);
      buffer::sec_item_from_bytes(&raw)
    }
    _ => {
      if iv_bytes.is_empty() {
        buffer::sec_item_from_bytes(&vec![0u8; iv_len_for_mech(mech)])
      } else {
        buffer::sec_item_from_bytes(iv_bytes)
      }
    }
  }
}

fn decode_iv(param_bytes: &[u8], block_len: usize) -> Result<Vec<u8>, ReturnCode> {
  if param_bytes.is_empty() {
    Ok(vec![0u8; block_len])
  } else if param_bytes.len() == block_len {
    Ok(param_bytes.to_vec())
  } else {
    Err(CKR_MECHANISM_PARAM_INVALID)
  }
}

fn decode_rc2_params(param_bytes: &[u8]) -> Result<(usize, [u8; 8]), ReturnCode> {
  if param_bytes.is_empty() {
    return Ok((0, [0u8; 8]));
  }
  if param_bytes.len() != mem::size_of::<CkRc2CbcParams>() {
    return Err(CKR_MECHANISM_PARAM_INVALID);
  }
  let params = unsafe { ptr::read_unaligned(param_bytes.as_ptr() as *const CkRc2CbcParams) };
  Ok((params.effective_bits as usize, params.iv))
}

unsafe fn build_context(
  mech: CkMechanismType,
  op: CkAttributeType,
  key: Pointer<SymKeyObject>,
  param: ConstPointer<SecItem>,
) -> Result<CipherContext, ReturnCode> {
  if key.is_null() {
    return Err(CKR_KEY_HANDLE_INVALID);
  }
  let key = &*key;
  if key.key_type != key_type_for_mech(mech)? {
    return Err(CKR_KEY_TYPE_INCONSISTENT);
  }
  let padded = is_pad_mech(mech);
  let param_bytes = buffer::sec_item_bytes(param);

  let engine = match mech {
    CKM_RC2_CBC | CKM_RC2_CBC_PAD => {
      let (effective_bits, iv) = decode_rc2_params(param_bytes)?;
      // Zero effective bits means the caller supplied no override: default to
      // the full stored key strength.
      let effective_bits = if effective_bits == 0 {
        key.material.len() * 8
      } else {
        effective_bits
      };
      engine::rc2_engine(op, &key.material, &iv, effective_bits, padded)?
    }
    CKM_AES_CBC | CKM_AES_CBC_PAD => {
      let iv = decode_iv(param_bytes, 16)?;
      match key.material.len() {
        16 => engine::cbc_engine::<Aes128>(op, &key.material, &iv, padded)?,
        24 => engine::cbc_engine::<Aes192>(op, &key.material, &iv, padded)?,
        32 => engine::cbc_engine::<Aes256>(op, &key.material, &iv, padded)?,
        _ => return Err(CKR_KEY_SIZE_RANGE),
      }
    }
    CKM_DES_CBC | CKM_DES_CBC_PAD => {
      let iv = decode_iv(param_bytes, 8)?;
      engine::cbc_engine::<Des>(op, &key.material, &iv, padded)?
    }
    CKM_DES3_CBC | CKM_DES3_CBC_PAD => {
      let iv = decode_iv(param_bytes, 8)?;
      engine::cbc_engine::<TdesEde3>(op, &key.material, &iv, padded)?
    }
    _ => return Err(CKR_MECHANISM_INVALID),
  };
  Ok(CipherContext { engine })
}

/// Create a stateful cipher context bound to (mechanism, operation, key,
/// parameter). The token copies what it needs out of `key` and `param`; both
/// remain owned by the caller. Returns null with the error slot set on failure.
pub unsafe fn create_context_by_sym_key(
  mech: CkMechanismType,
  op: CkAttributeType,
  key: Pointer<SymKeyObject>,
  param: ConstPointer<SecItem>,
) -> Pointer<CipherContext> {
  match build_context(mech, op, key, param) {
    Ok(context) => {
      LIVE_CONTEXTS.fetch_add(1, Ordering::SeqCst);
      Box::into_raw(Box::new(context))
    }
    Err(rc) => {
      set_error(rc);
      ptr::null_mut()
    }
  }
}

/// Streaming transform: consume `inlen` input bytes, write up to `maxout`
/// output bytes, and report the produced length through `outlen`. A cipher may
/// buffer partial blocks and emit nothing.
pub unsafe fn cipher_op(
  context: Pointer<CipherContext>,
  out: *mut u8,
  outlen: *mut c_uint,
  maxout: c_uint,
  input: *const u8,
  inlen: c_uint,
) -> SecStatus {
  if context.is_null() || out.is_null() || outlen.is_null() {
    set_error(CKR_ARGUMENTS_BAD);
    return SecStatus::Failure;
  }
  let context = &mut *context;
  let input = if input.is_null() {
    &[][..]
  } else {
    slice::from_raw_parts(input, inlen as usize)
  };
  let out = slice::from_raw_parts_mut(out, maxout as usize);
  match context.engine.update(input, out) {
    Ok(n) => {
      *outlen = n as c_uint;
      SecStatus::Success
    }
    Err(rc) => {
      set_error(rc);
      SecStatus::Failure
    }
  }
}

/// Drain the context: emit the final (padded) block, or nothing. The context
/// itself stays alive; destruction is a separate call.
pub unsafe fn digest_final(
  context: Pointer<CipherContext>,
  out: *mut u8,
  outlen: *mut c_uint,
  maxout: c_uint,
) -> SecStatus {
  if context.is_null() || out.is_null() || outlen.is_null() {
    set_error(CKR_ARGUMENTS_BAD);
    return SecStatus::Failure;
  }
  let context = &mut *context;
  let out = slice::from_raw_parts_mut(out, maxout as usize);
  match context.engine.finish(out) {
    Ok(n) => {
      *outlen = n as c_uint;
      SecStatus::Success
    }
    Err(rc) => {
      set_error(rc);
      SecStatus::Failure
    }
  }
}

/// Destroy a cipher context. Null-safe, but the managed layer guarantees it is
/// never called twice for the same pointer (the proxy clears its slot first).
pub unsafe fn destroy_context(context: Pointer<CipherContext>) {
  if !context.is_null() {
    drop(Box::from_raw(context));
    LIVE_CONTEXTS.fetch_sub(1, Ordering::SeqCst);
  }
}
