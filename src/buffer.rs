//! Transfer layer between managed byte sequences and the token's native items.
//!
//! Everything allocated here is released on every exit path: parameter and IV
//! items travel inside [ItemGuard] so early error returns cannot leak them, and
//! sensitive item payloads are zeroized before their memory goes back to the
//! allocator.

use crate::handle::{ConstPointer, Pointer};

use libc::c_uint;
use zeroize::Zeroize;

use std::ptr;
use std::slice;

/// `SECItem`: a native (length, data-pointer) pair. `data` is null exactly when
/// `len` is zero.
#[repr(C)]
#[derive(Debug)]
pub struct SecItem {
  pub data: *mut u8,
  pub len: c_uint,
}

/// Copy managed bytes into a freshly allocated native item. The item itself is
/// always non-null; an empty slice yields a present-but-empty item, which some
/// mechanisms require in place of a missing parameter.
pub unsafe fn sec_item_from_bytes(bytes: &[u8]) -> Pointer<SecItem> {
  let data = if bytes.is_empty() {
    ptr::null_mut()
  } else {
    Box::into_raw(bytes.to_vec().into_boxed_slice()) as *mut u8
  };
  Box::into_raw(Box::new(SecItem {
    data,
    len: bytes.len() as c_uint,
  }))
}

/// Borrow the payload of a native item. Empty for a null item or a null payload.
pub unsafe fn sec_item_bytes<'a>(item: ConstPointer<SecItem>) -> &'a [u8] {
  if item.is_null() || (*item).data.is_null() {
    &[]
  } else {
    slice::from_raw_parts((*item).data, (*item).len as usize)
  }
}

/// Free a native item and its payload, zeroizing the payload first. Null-safe.
pub unsafe fn sec_item_free(item: Pointer<SecItem>) {
  if item.is_null() {
    return;
  }
  let item = Box::from_raw(item);
  if !item.data.is_null() {
    let mut data: Box<[u8]> =
      Box::from_raw(slice::from_raw_parts_mut(item.data, item.len as usize) as *mut [u8]);
    data.zeroize();
  }
}

/// Scope guard for a native item: frees it when the scope exits, success or
/// failure. Ownership never transfers into a created context (the token copies
/// parameters at context creation), so the guard's release is unconditional.
pub(crate) struct ItemGuard(Pointer<SecItem>);

impl ItemGuard {
  pub fn wrap(item: Pointer<SecItem>) -> Self {
    Self(item)
  }

  pub fn as_ptr(&self) -> ConstPointer<SecItem> {
    self.0
  }

  pub fn as_mut_ptr(&self) -> Pointer<SecItem> {
    self.0
  }
}

impl Drop for ItemGuard {
  fn drop(&mut self) {
    unsafe { sec_item_free(self.0) };
  }
}

/// Output staging buffer for one native call: allocated at the caller-computed
/// capacity, handed to the token as (pointer, capacity), then shrunk to the
/// actual produced length. The capacity is never what the caller sees; the
/// returned byte sequence is sized exactly to the output.
pub(crate) struct OutputBuffer {
  buf: Vec<u8>,
}

impl OutputBuffer {
  pub fn sized(capacity: usize) -> Self {
    Self {
      buf: vec![0u8; capacity],
    }
  }

  pub fn capacity(&self) -> c_uint {
    self.buf.len() as c_uint
  }

  pub fn as_mut_ptr(&mut self) -> *mut u8 {
    self.buf.as_mut_ptr()
  }

  pub fn into_produced(mut self, len: usize) -> Vec<u8> {
    debug_assert!(len <= self.buf.len());
    self.buf.truncate(len);
    self.buf
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn empty_item_is_present_but_empty() {
    unsafe {
      let item = sec_item_from_bytes(&[]);
      assert!(!item.is_null());
      assert!((*item).data.is_null());
      assert_eq!((*item).len, 0);
      assert!(sec_item_bytes(item).is_empty());
      sec_item_free(item);
    }
  }

  #[test]
  fn item_round_trips_payload() {
    unsafe {
      let item = sec_item_from_bytes(b"\x01\x02\x03");
      assert_eq!(sec_item_bytes(item), b"\x01\x02\x03");
      sec_item_free(item);
    }
  }

  #[test]
  fn guard_frees_on_scope_exit() {
    // No assertion beyond not crashing under the allocator; the guard's whole
    // contract is exercised by the leak-sensitive lifecycle tests.
    let _guard = ItemGuard::wrap(unsafe { sec_item_from_bytes(b"iv-bytes") });
  }

  #[test]
  fn output_buffer_shrinks_to_produced_length() {
    let mut out = OutputBuffer::sized(24);
    assert_eq!(out.capacity(), 24);
    unsafe { *out.as_mut_ptr() = 0xab };
    let produced = out.into_produced(1);
    assert_eq!(produced, vec![0xab]);
  }
}
