//! Streaming block-cipher engines backing the token's opaque cipher contexts.
//!
//! The engines only do mechanism plumbing: partial-block staging between calls,
//! PKCS #7 padding arithmetic, and the hold-back of the final ciphertext block
//! for padded decryption. The block transforms themselves come from the
//! RustCrypto mode/cipher crates.

use crate::error::ReturnCode;
use crate::softoken::consts::{self, CkAttributeType};

use cipher::block_padding::{Padding, Pkcs7};
use cipher::typenum::Unsigned;
use cipher::{
  Block, BlockCipher, BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit, KeyIvInit,
};
use rc2::Rc2;
use zeroize::Zeroize;

use std::mem;

/// One live cipher transform: internal state advances on [StreamEngine::update]
/// (staging partial blocks) and drains on [StreamEngine::finish]. A successful
/// finish is terminal; later calls fail with
/// [CKR_OPERATION_NOT_INITIALIZED][consts::CKR_OPERATION_NOT_INITIALIZED].
pub(crate) trait StreamEngine: Send {
  /// Consume `input`, writing zero or more whole blocks into `out`. Returns the
  /// number of bytes written, never more than `input.len()` plus one block.
  fn update(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize, ReturnCode>;

  /// Flush the final (padded) block, or verify that nothing is left staged.
  /// Writes at most one block.
  fn finish(&mut self, out: &mut [u8]) -> Result<usize, ReturnCode>;
}

pub(crate) struct EncryptEngine<M: BlockEncryptMut> {
  mode: M,
  staged: Vec<u8>,
  padded: bool,
  finished: bool,
}

impl<M: BlockEncryptMut> EncryptEngine<M> {
  fn new(mode: M, padded: bool) -> Self {
    Self {
      mode,
      staged: Vec::new(),
      padded,
      finished: false,
    }
  }
}

impl<M: BlockEncryptMut + Send> StreamEngine for EncryptEngine<M> {
  fn update(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize, ReturnCode> {
    if self.finished {
      return Err(consts::CKR_OPERATION_NOT_INITIALIZED);
    }
    let b = M::BlockSize::USIZE;
    let mut data = mem::take(&mut self.staged);
    data.extend_from_slice(input);
    let full = data.len() - data.len() % b;
    if out.len() < full {
      self.staged = data;
      return Err(consts::CKR_BUFFER_TOO_SMALL);
    }
    for (src, dst) in data[..full]
      .chunks_exact(b)
      .zip(out[..full].chunks_exact_mut(b))
    {
      let mut block = Block::<M>::clone_from_slice(src);
      self.mode.encrypt_block_mut(&mut block);
      dst.copy_from_slice(&block);
    }
    self.staged.extend_from_slice(&data[full..]);
    data.zeroize();
    Ok(full)
  }

  fn finish(&mut self, out: &mut [u8]) -> Result<usize, ReturnCode> {
    if self.finished {
      return Err(consts::CKR_OPERATION_NOT_INITIALIZED);
    }
    let b = M::BlockSize::USIZE;
    if !self.padded {
      return if self.staged.is_empty() {
        self.finished = true;
        Ok(0)
      } else {
        Err(consts::CKR_DATA_LEN_RANGE)
      };
    }
    if out.len() < b {
      return Err(consts::CKR_BUFFER_TOO_SMALL);
    }
    let mut block = Block::<M>::default();
    block[..self.staged.len()].copy_from_slice(&self.staged);
    Pkcs7::pad(&mut block, self.staged.len());
    self.mode.encrypt_block_mut(&mut block);
    out[..b].copy_from_slice(&block);
    self.staged.zeroize();
    self.staged.clear();
    self.finished = true;
    Ok(b)
  }
}

impl<M: BlockEncryptMut> Drop for EncryptEngine<M> {
  fn drop(&mut self) {
    self.staged.zeroize();
  }
}

pub(crate) struct DecryptEngine<M: BlockDecryptMut> {
  mode: M,
  staged: Vec<u8>,
  padded: bool,
  finished: bool,
}

impl<M: BlockDecryptMut> DecryptEngine<M> {
  fn new(mode: M, padded: bool) -> Self {
    Self {
      mode,
      staged: Vec::new(),
      padded,
      finished: false,
    }
  }
}

impl<M: BlockDecryptMut + Send> StreamEngine for DecryptEngine<M> {
  fn update(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize, ReturnCode> {
    if self.finished {
      return Err(consts::CKR_OPERATION_NOT_INITIALIZED);
    }
    let b = M::BlockSize::USIZE;
    let mut data = mem::take(&mut self.staged);
    data.extend_from_slice(input);
    // Padded decryption holds back one whole block: the last ciphertext block
    // carries the padding and may only be emitted by finish().
    let hold = if self.padded { b } else { 0 };
    let full = data.len().saturating_sub(hold) / b * b;
    if out.len() < full {
      self.staged = data;
      return Err(consts::CKR_BUFFER_TOO_SMALL);
    }
    for (src, dst) in data[..full]
      .chunks_exact(b)
      .zip(out[..full].chunks_exact_mut(b))
    {
      let mut block = Block::<M>::clone_from_slice(src);
      self.mode.decrypt_block_mut(&mut block);
      dst.copy_from_slice(&block);
    }
    self.staged.extend_from_slice(&data[full..]);
    data.zeroize();
    Ok(full)
  }

  fn finish(&mut self, out: &mut [u8]) -> Result<usize, ReturnCode> {
    if self.finished {
      return Err(consts::CKR_OPERATION_NOT_INITIALIZED);
    }
    let b = M::BlockSize::USIZE;
    if !self.padded {
      return if self.staged.is_empty() {
        self.finished = true;
        Ok(0)
      } else {
        Err(consts::CKR_ENCRYPTED_DATA_LEN_RANGE)
      };
    }
    if self.staged.len() != b {
      return Err(consts::CKR_ENCRYPTED_DATA_LEN_RANGE);
    }
    let mut block = Block::<M>::clone_from_slice(&self.staged);
    self.mode.decrypt_block_mut(&mut block);
    let message = Pkcs7::unpad(&block).map_err(|_| consts::CKR_ENCRYPTED_DATA_INVALID)?;
    if out.len() < message.len() {
      return Err(consts::CKR_BUFFER_TOO_SMALL);
    }
    out[..message.len()].copy_from_slice(message);
    self.staged.zeroize();
    self.staged.clear();
    self.finished = true;
    Ok(message.len())
  }
}

impl<M: BlockDecryptMut> Drop for DecryptEngine<M> {
  fn drop(&mut self) {
    self.staged.zeroize();
  }
}

/// Build a CBC engine for a fixed-strength block cipher, in either direction.
/// `iv` must already be block-length (the caller normalizes empty parameters to
/// a zero IV).
pub(crate) fn cbc_engine<C>(
  op: CkAttributeType,
  key: &[u8],
  iv: &[u8],
  padded: bool,
) -> Result<Box<dyn StreamEngine>, ReturnCode>
where
  C: BlockCipher + BlockEncryptMut + BlockDecryptMut + KeyInit + Send + 'static,
{
  match op {
    consts::CKA_ENCRYPT => {
      let mode = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| consts::CKR_MECHANISM_PARAM_INVALID)?;
      Ok(Box::new(EncryptEngine::new(mode, padded)))
    }
    consts::CKA_DECRYPT => {
      let mode = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| consts::CKR_MECHANISM_PARAM_INVALID)?;
      Ok(Box::new(DecryptEngine::new(mode, padded)))
    }
    _ => Err(consts::CKR_ARGUMENTS_BAD),
  }
}

/// RC2 is the variable-strength special case: the key schedule depends on the
/// effective key bits from the mechanism parameter, not just the stored key.
pub(crate) fn rc2_engine(
  op: CkAttributeType,
  key: &[u8],
  iv: &[u8],
  effective_bits: usize,
  padded: bool,
) -> Result<Box<dyn StreamEngine>, ReturnCode> {
  if !(1..=1024).contains(&effective_bits) {
    return Err(consts::CKR_MECHANISM_PARAM_INVALID);
  }
  match op {
    consts::CKA_ENCRYPT => {
      let mode = cbc::Encryptor::<Rc2>::inner_iv_slice_init(
        Rc2::new_with_eff_key_len(key, effective_bits),
        iv,
      )
      .map_err(|_| consts::CKR_MECHANISM_PARAM_INVALID)?;
      Ok(Box::new(EncryptEngine::new(mode, padded)))
    }
    consts::CKA_DECRYPT => {
      let mode = cbc::Decryptor::<Rc2>::inner_iv_slice_init(
        Rc2::new_with_eff_key_len(key, effective_bits),
        iv,
      )
      .map_err(|_| consts::CKR_MECHANISM_PARAM_INVALID)?;
      Ok(Box::new(DecryptEngine::new(mode, padded)))
    }
    _ => Err(consts::CKR_ARGUMENTS_BAD),
  }
}
