//! Algorithm descriptors and their resolution to token mechanism codes.
//!
//! Resolution is a plain table: descriptors the token has no mechanism for map
//! to [CKM_INVALID_MECHANISM][consts::CKM_INVALID_MECHANISM], which the
//! lifecycle manager reports as an unresolvable algorithm.

use crate::softoken::consts::{self, CkMechanismType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherFamily {
  Aes,
  Des,
  Des3,
  Rc2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
  Cbc,
  /// No ECB mechanisms in this token build; ECB descriptors never resolve.
  Ecb,
}

/// Descriptor for a symmetric cipher/mode pair, the managed-side view of an
/// algorithm before mechanism resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionAlg {
  pub family: CipherFamily,
  pub mode: CipherMode,
}

impl EncryptionAlg {
  pub const AES_CBC: Self = Self {
    family: CipherFamily::Aes,
    mode: CipherMode::Cbc,
  };
  pub const DES_CBC: Self = Self {
    family: CipherFamily::Des,
    mode: CipherMode::Cbc,
  };
  pub const DES3_CBC: Self = Self {
    family: CipherFamily::Des3,
    mode: CipherMode::Cbc,
  };
  pub const RC2_CBC: Self = Self {
    family: CipherFamily::Rc2,
    mode: CipherMode::Cbc,
  };

  /// Base (unpadded) mechanism for this descriptor, or the invalid-mechanism
  /// sentinel.
  pub(crate) fn mechanism(self) -> CkMechanismType {
    match (self.family, self.mode) {
      (CipherFamily::Aes, CipherMode::Cbc) => consts::CKM_AES_CBC,
      (CipherFamily::Des, CipherMode::Cbc) => consts::CKM_DES_CBC,
      (CipherFamily::Des3, CipherMode::Cbc) => consts::CKM_DES3_CBC,
      (CipherFamily::Rc2, CipherMode::Cbc) => consts::CKM_RC2_CBC,
      (_, CipherMode::Ecb) => consts::CKM_INVALID_MECHANISM,
    }
  }

  /// Block length in bytes for this cipher family, the unit for update/finalize
  /// buffer sizing.
  pub fn block_len(self) -> usize {
    match self.family {
      CipherFamily::Aes => 16,
      CipherFamily::Des | CipherFamily::Des3 | CipherFamily::Rc2 => 8,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn cbc_descriptors_resolve() {
    assert_eq!(EncryptionAlg::AES_CBC.mechanism(), consts::CKM_AES_CBC);
    assert_eq!(EncryptionAlg::RC2_CBC.mechanism(), consts::CKM_RC2_CBC);
  }

  #[test]
  fn ecb_descriptors_do_not_resolve() {
    let alg = EncryptionAlg {
      family: CipherFamily::Aes,
      mode: CipherMode::Ecb,
    };
    assert_eq!(alg.mechanism(), consts::CKM_INVALID_MECHANISM);
  }
}
