//! PKCS #11 constants understood by the soft token, with their standard values.

use crate::error::ReturnCode;

use libc::c_ulong;

pub type CkMechanismType = c_ulong;
pub type CkAttributeType = c_ulong;
pub type CkKeyType = c_ulong;

pub const CKA_ENCRYPT: CkAttributeType = 0x0104;
pub const CKA_DECRYPT: CkAttributeType = 0x0105;

pub const CKM_RC2_CBC: CkMechanismType = 0x0102;
pub const CKM_RC2_CBC_PAD: CkMechanismType = 0x0105;
pub const CKM_DES_CBC: CkMechanismType = 0x0122;
pub const CKM_DES_CBC_PAD: CkMechanismType = 0x0125;
pub const CKM_DES3_CBC: CkMechanismType = 0x0133;
pub const CKM_DES3_CBC_PAD: CkMechanismType = 0x0136;
pub const CKM_AES_CBC: CkMechanismType = 0x1082;
pub const CKM_AES_CBC_PAD: CkMechanismType = 0x1085;
/// Sentinel for descriptors with no token mechanism.
pub const CKM_INVALID_MECHANISM: CkMechanismType = 0xffff_ffff;

pub const CKK_RC2: CkKeyType = 0x11;
pub const CKK_DES: CkKeyType = 0x13;
pub const CKK_DES3: CkKeyType = 0x15;
pub const CKK_AES: CkKeyType = 0x1f;

pub const CKR_OK: ReturnCode = 0x0000;
pub const CKR_HOST_MEMORY: ReturnCode = 0x0002;
pub const CKR_GENERAL_ERROR: ReturnCode = 0x0005;
pub const CKR_ARGUMENTS_BAD: ReturnCode = 0x0007;
pub const CKR_DATA_LEN_RANGE: ReturnCode = 0x0021;
pub const CKR_ENCRYPTED_DATA_INVALID: ReturnCode = 0x0040;
pub const CKR_ENCRYPTED_DATA_LEN_RANGE: ReturnCode = 0x0041;
pub const CKR_KEY_HANDLE_INVALID: ReturnCode = 0x0060;
pub const CKR_KEY_SIZE_RANGE: ReturnCode = 0x0062;
pub const CKR_KEY_TYPE_INCONSISTENT: ReturnCode = 0x0063;
pub const CKR_MECHANISM_INVALID: ReturnCode = 0x0070;
pub const CKR_MECHANISM_PARAM_INVALID: ReturnCode = 0x0071;
pub const CKR_OPERATION_NOT_INITIALIZED: ReturnCode = 0x0091;
pub const CKR_BUFFER_TOO_SMALL: ReturnCode = 0x0150;

/// `CK_RC2_CBC_PARAMS`: the one mechanism family whose parameter block carries
/// more than an IV. The effective-bits field is patched in place after generic
/// parameter construction (see [crate::context::init_context_with_key_bits]).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CkRc2CbcParams {
  pub effective_bits: c_ulong,
  pub iv: [u8; 8],
}
