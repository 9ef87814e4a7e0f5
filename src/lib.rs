//! Authentication building blocks for eMRTDs (Electronic Machine Readable
//! Travel Documents).
//!
//! The `emrtd_auth` crate provides the pieces that sit underneath the
//! authentication protocols of ICAO Doc 9303: the octet-string codec used by
//! PACE and Active Authentication, the registry of standardized PACE domain
//! parameters, the `EF.CVCA` file that anchors Terminal Authentication, and a
//! thread-safe APDU sender that drives `INTERNAL AUTHENTICATE` over an
//! established secure messaging session.
//!
//! Key derivation and the secure messaging transforms themselves are out of
//! scope; the sender talks to them through the [`SecureMessaging`] trait.
//!
//! # Quick Start
//!
//! ```
//! use emrtd_auth::{
//!     padding_method_2, remove_padding, CVCAFile, LdsFile, PaceInfo,
//!     ID_PACE_ECDH_GM_AES_CBC_CMAC_256, PARAM_ID_ECP_NIST_P256_R1,
//! };
//!
//! fn main() -> Result<(), emrtd_auth::EmrtdError> {
//!     let pace_info = PaceInfo::new(
//!         ID_PACE_ECDH_GM_AES_CBC_CMAC_256,
//!         2,
//!         Some(PARAM_ID_ECP_NIST_P256_R1),
//!     )?;
//!     assert_eq!(
//!         pace_info.protocol_oid_string(),
//!         "id-PACE-ECDH-GM-AES-CBC-CMAC-256"
//!     );
//!
//!     let padded = padding_method_2(b"challenge", 16)?;
//!     assert_eq!(remove_padding(&padded)?, b"challenge");
//!
//!     let cvca = CVCAFile::new("UTOPIA", None)?;
//!     assert_eq!(cvca.encode().len(), 36);
//!
//!     Ok(())
//! }
//! ```

use rand::{rngs::OsRng, CryptoRng, RngCore};
use std::fmt;
use std::sync::Mutex;
use tracing::{error, info, trace, warn};

/// Errors that can occur in this crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum EmrtdError {
    RecvApduError(u8, u8),
    InvalidArgument(&'static str),
    ParseDataError(String),
    InvalidOidError(),
    InvalidFileStructure(&'static str),
    InvalidResponseError(),
    PcscError(pcsc::Error),
}

impl fmt::Display for EmrtdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RecvApduError(sw1, sw2) => {
                write!(f, "APDU error, SW1: {sw1:02X}, SW2: {sw2:02X}")
            }
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::ParseDataError(error_msg) => write!(f, "Error while parsing data: {error_msg}"),
            Self::InvalidOidError() => write!(f, "Invalid OID given"),
            Self::InvalidFileStructure(error_msg) => {
                write!(f, "Invalid EF structure: {error_msg}")
            }
            Self::InvalidResponseError() => write!(f, "Card response is invalid"),
            Self::PcscError(e) => write!(f, "PC/SC error: {e}"),
        }
    }
}

impl std::error::Error for EmrtdError {}

/// Converts a byte slice to an uppercase hex string.
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02X}")).collect()
}

/// Converts a hex string to bytes, ignoring ASCII whitespace.
///
/// # Errors
///
/// `EmrtdError::ParseDataError` if the string has an odd number of digits or
/// contains a character that is not a hex digit.
pub fn hex2bytes(text: &str) -> Result<Vec<u8>, EmrtdError> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(EmrtdError::ParseDataError(
            "hex string has an odd number of digits".to_owned(),
        ));
    }
    digits
        .chunks_exact(2)
        .map(|pair| Ok(hex_digit(pair[0])? << 4 | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(digit: u8) -> Result<u8, EmrtdError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(EmrtdError::ParseDataError(format!(
            "invalid hex digit {:#04X}",
            digit
        ))),
    }
}

/// Pads the data according to ISO/IEC 9797-1 padding method 2.
///
/// A mandatory `0x80` marker byte is appended, followed by zero bytes until
/// the length is a multiple of `block_size`. Data whose length is already a
/// multiple of the block size therefore grows by a full block.
///
/// # Arguments
///
/// * `data` - Data to be padded.
/// * `block_size` - Block size to pad to, must be non-zero.
///
/// # Errors
///
/// `EmrtdError::InvalidArgument` if `block_size` is `0`.
pub fn padding_method_2(data: &[u8], block_size: usize) -> Result<Vec<u8>, EmrtdError> {
    if block_size == 0 {
        error!("Can not pad to a block size of 0");
        return Err(EmrtdError::InvalidArgument("block size must be non-zero"));
    }
    let mut padded = Vec::with_capacity(data.len() + block_size);
    padded.extend_from_slice(data);
    padded.push(0x80);
    while padded.len() % block_size != 0 {
        padded.push(0x00);
    }
    Ok(padded)
}

/// Removes ISO/IEC 9797-1 padding method 2 from the data.
///
/// Scans from the end past any zero bytes and cuts at the `0x80` marker.
///
/// # Errors
///
/// `EmrtdError::ParseDataError` if no marker byte is found.
pub fn remove_padding(data: &[u8]) -> Result<&[u8], EmrtdError> {
    for (i, &byte) in data.iter().enumerate().rev() {
        match byte {
            0x00 => continue,
            0x80 => return Ok(&data[..i]),
            _ => break,
        }
    }
    error!("Found padded data that does not contain a 0x80 marker byte");
    Err(EmrtdError::ParseDataError(
        "padding marker byte 0x80 not found".to_owned(),
    ))
}

/// Splits the data into consecutive segments of `segment_size` bytes.
///
/// The last segment may be shorter; empty input yields no segments.
///
/// # Errors
///
/// `EmrtdError::InvalidArgument` if `segment_size` is `0`.
pub fn partition(data: &[u8], segment_size: usize) -> Result<Vec<Vec<u8>>, EmrtdError> {
    if segment_size == 0 {
        return Err(EmrtdError::InvalidArgument("segment size must be non-zero"));
    }
    Ok(data.chunks(segment_size).map(<[u8]>::to_vec).collect())
}

/// Removes leading zero bytes, keeping a single `0x00` for all-zero input.
#[must_use]
pub fn strip_leading_zeroes(data: &[u8]) -> Vec<u8> {
    match data.iter().position(|&byte| byte != 0) {
        Some(first_non_zero) => data[first_non_zero..].to_vec(),
        None => vec![0],
    }
}

/// Encodes a non-negative integer as a minimal big-endian octet string.
///
/// Zero encodes as a single `0x00` byte.
///
/// # Errors
///
/// `EmrtdError::InvalidArgument` if `value` is negative.
pub fn i2os(value: i128) -> Result<Vec<u8>, EmrtdError> {
    if value < 0 {
        return Err(EmrtdError::InvalidArgument(
            "can not encode a negative integer",
        ));
    }
    Ok(strip_leading_zeroes(&value.to_be_bytes()))
}

/// An affine elliptic curve point with big-endian coordinates.
///
/// Coordinates are held in minimal form, leading zero bytes are stripped on
/// construction so that points compare equal regardless of how the caller
/// padded them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ECPoint {
    x: Vec<u8>,
    y: Vec<u8>,
}

impl ECPoint {
    #[must_use]
    pub fn new(x: &[u8], y: &[u8]) -> Self {
        Self {
            x: strip_leading_zeroes(x),
            y: strip_leading_zeroes(y),
        }
    }

    #[must_use]
    pub fn x(&self) -> &[u8] {
        &self.x
    }

    #[must_use]
    pub fn y(&self) -> &[u8] {
        &self.y
    }
}

/// Encodes an EC point in uncompressed form per BSI TR-03111:
/// `0x04 || X || Y` with both coordinates left-padded to the field width.
///
/// # Arguments
///
/// * `point` - The point to encode.
/// * `field_bits` - Bit size of the underlying prime field, e.g. `256` for
///   secp256r1 or `521` for secp521r1.
///
/// # Errors
///
/// `EmrtdError::InvalidArgument` if `field_bits` is `0` or a coordinate does
/// not fit the field width.
pub fn ec_point_to_os(point: &ECPoint, field_bits: usize) -> Result<Vec<u8>, EmrtdError> {
    if field_bits == 0 {
        return Err(EmrtdError::InvalidArgument("field size must be non-zero"));
    }
    let width = field_bits.div_ceil(8);
    if point.x.len() > width || point.y.len() > width {
        return Err(EmrtdError::InvalidArgument(
            "EC point coordinate does not fit the field size",
        ));
    }
    let mut encoded = Vec::with_capacity(1 + 2 * width);
    encoded.push(0x04);
    encoded.resize(1 + width - point.x.len(), 0x00);
    encoded.extend_from_slice(&point.x);
    encoded.resize(1 + 2 * width - point.y.len(), 0x00);
    encoded.extend_from_slice(&point.y);
    Ok(encoded)
}

/// Decodes an uncompressed EC point encoding, the inverse of
/// [`ec_point_to_os`].
///
/// # Errors
///
/// `EmrtdError::ParseDataError` if the encoding does not start with `0x04` or
/// the coordinate halves have uneven length.
pub fn os_to_ec_point(encoded: &[u8]) -> Result<ECPoint, EmrtdError> {
    match encoded.split_first() {
        Some((&0x04, coordinates)) if coordinates.len() % 2 == 0 => {
            let (x, y) = coordinates.split_at(coordinates.len() / 2);
            Ok(ECPoint::new(x, y))
        }
        Some((&0x04, _)) => Err(EmrtdError::ParseDataError(
            "EC point coordinates have uneven length".to_owned(),
        )),
        _ => Err(EmrtdError::ParseDataError(
            "EC point encoding must start with 0x04".to_owned(),
        )),
    }
}

/// Block ciphers used by PACE secure messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionAlgorithm {
    DES3,
    AES128,
    AES192,
    AES256,
}

/// MAC algorithms used by PACE secure messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    DES,
    AESCMAC,
}

/// Key agreement algorithms available to PACE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAgreement {
    Dh,
    Ecdh,
}

impl fmt::Display for KeyAgreement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Dh => write!(f, "DH"),
            Self::Ecdh => write!(f, "ECDH"),
        }
    }
}

/// Mapping functions available to PACE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingType {
    Gm,
    Im,
    Cam,
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Gm => write!(f, "GM"),
            Self::Im => write!(f, "IM"),
            Self::Cam => write!(f, "CAM"),
        }
    }
}

/// Object identifier prefix shared by all PACE protocol variants,
/// `bsi-de (0.4.0.127.0.7) protocols(2) smartcard(2) pace(4)`.
pub const PACE_OID_PREFIX: &str = "0.4.0.127.0.7.2.2.4";

pub const ID_PACE_DH_GM_3DES_CBC_CBC: &str = "0.4.0.127.0.7.2.2.4.1.1";
pub const ID_PACE_DH_GM_AES_CBC_CMAC_128: &str = "0.4.0.127.0.7.2.2.4.1.2";
pub const ID_PACE_DH_GM_AES_CBC_CMAC_192: &str = "0.4.0.127.0.7.2.2.4.1.3";
pub const ID_PACE_DH_GM_AES_CBC_CMAC_256: &str = "0.4.0.127.0.7.2.2.4.1.4";
pub const ID_PACE_ECDH_GM_3DES_CBC_CBC: &str = "0.4.0.127.0.7.2.2.4.2.1";
pub const ID_PACE_ECDH_GM_AES_CBC_CMAC_128: &str = "0.4.0.127.0.7.2.2.4.2.2";
pub const ID_PACE_ECDH_GM_AES_CBC_CMAC_192: &str = "0.4.0.127.0.7.2.2.4.2.3";
pub const ID_PACE_ECDH_GM_AES_CBC_CMAC_256: &str = "0.4.0.127.0.7.2.2.4.2.4";
pub const ID_PACE_DH_IM_3DES_CBC_CBC: &str = "0.4.0.127.0.7.2.2.4.3.1";
pub const ID_PACE_DH_IM_AES_CBC_CMAC_128: &str = "0.4.0.127.0.7.2.2.4.3.2";
pub const ID_PACE_DH_IM_AES_CBC_CMAC_192: &str = "0.4.0.127.0.7.2.2.4.3.3";
pub const ID_PACE_DH_IM_AES_CBC_CMAC_256: &str = "0.4.0.127.0.7.2.2.4.3.4";
pub const ID_PACE_ECDH_IM_3DES_CBC_CBC: &str = "0.4.0.127.0.7.2.2.4.4.1";
pub const ID_PACE_ECDH_IM_AES_CBC_CMAC_128: &str = "0.4.0.127.0.7.2.2.4.4.2";
pub const ID_PACE_ECDH_IM_AES_CBC_CMAC_192: &str = "0.4.0.127.0.7.2.2.4.4.3";
pub const ID_PACE_ECDH_IM_AES_CBC_CMAC_256: &str = "0.4.0.127.0.7.2.2.4.4.4";
pub const ID_PACE_ECDH_CAM_AES_CBC_CMAC_128: &str = "0.4.0.127.0.7.2.2.4.6.2";
pub const ID_PACE_ECDH_CAM_AES_CBC_CMAC_192: &str = "0.4.0.127.0.7.2.2.4.6.3";
pub const ID_PACE_ECDH_CAM_AES_CBC_CMAC_256: &str = "0.4.0.127.0.7.2.2.4.6.4";

/// A PACE protocol variant, the decoded form of one of the 19 standardized
/// protocol object identifiers from ICAO Doc 9303-11.
///
/// Only valid combinations can be represented: CAM exists for ECDH with AES
/// only, so an OID such as `0.4.0.127.0.7.2.2.4.6.1` is rejected at parse
/// time and can never be produced by [`PaceProtocol::oid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaceProtocol {
    pub key_agreement: KeyAgreement,
    pub mapping: MappingType,
    pub cipher: EncryptionAlgorithm,
}

impl PaceProtocol {
    /// Parses a dotted-decimal PACE protocol OID.
    ///
    /// # Errors
    ///
    /// `EmrtdError::InvalidOidError` if the OID is not one of the 19 PACE
    /// protocol identifiers.
    pub fn from_oid(oid: &str) -> Result<Self, EmrtdError> {
        let Some(suffix) = oid.strip_prefix("0.4.0.127.0.7.2.2.4.") else {
            return Err(EmrtdError::InvalidOidError());
        };
        let Some((mapping_arc, cipher_arc)) = suffix.split_once('.') else {
            return Err(EmrtdError::InvalidOidError());
        };
        let (key_agreement, mapping) = match mapping_arc {
            "1" => (KeyAgreement::Dh, MappingType::Gm),
            "2" => (KeyAgreement::Ecdh, MappingType::Gm),
            "3" => (KeyAgreement::Dh, MappingType::Im),
            "4" => (KeyAgreement::Ecdh, MappingType::Im),
            "6" => (KeyAgreement::Ecdh, MappingType::Cam),
            _ => return Err(EmrtdError::InvalidOidError()),
        };
        let cipher = match cipher_arc {
            "1" => EncryptionAlgorithm::DES3,
            "2" => EncryptionAlgorithm::AES128,
            "3" => EncryptionAlgorithm::AES192,
            "4" => EncryptionAlgorithm::AES256,
            _ => return Err(EmrtdError::InvalidOidError()),
        };
        // CAM requires AES secure messaging.
        if mapping == MappingType::Cam && cipher == EncryptionAlgorithm::DES3 {
            return Err(EmrtdError::InvalidOidError());
        }
        Ok(Self {
            key_agreement,
            mapping,
            cipher,
        })
    }

    /// Returns the dotted-decimal OID of this protocol variant.
    #[must_use]
    pub fn oid(&self) -> String {
        let mapping_arc = match (self.key_agreement, self.mapping) {
            (KeyAgreement::Dh, MappingType::Gm) => 1,
            (KeyAgreement::Ecdh, MappingType::Gm) => 2,
            (KeyAgreement::Dh, MappingType::Im) => 3,
            (KeyAgreement::Ecdh, MappingType::Im) => 4,
            (KeyAgreement::Dh, MappingType::Cam) | (KeyAgreement::Ecdh, MappingType::Cam) => 6,
        };
        let cipher_arc = match self.cipher {
            EncryptionAlgorithm::DES3 => 1,
            EncryptionAlgorithm::AES128 => 2,
            EncryptionAlgorithm::AES192 => 3,
            EncryptionAlgorithm::AES256 => 4,
        };
        format!("{PACE_OID_PREFIX}.{mapping_arc}.{cipher_arc}")
    }

    /// Returns the MAC algorithm paired with this protocol's cipher.
    #[must_use]
    pub fn mac_algorithm(&self) -> MacAlgorithm {
        match self.cipher {
            EncryptionAlgorithm::DES3 => MacAlgorithm::DES,
            _ => MacAlgorithm::AESCMAC,
        }
    }
}

impl fmt::Display for PaceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let cipher = match self.cipher {
            EncryptionAlgorithm::DES3 => "3DES-CBC-CBC",
            EncryptionAlgorithm::AES128 => "AES-CBC-CMAC-128",
            EncryptionAlgorithm::AES192 => "AES-CBC-CMAC-192",
            EncryptionAlgorithm::AES256 => "AES-CBC-CMAC-256",
        };
        write!(f, "id-PACE-{}-{}-{}", self.key_agreement, self.mapping, cipher)
    }
}

pub const PARAM_ID_GFP_1024_160: u8 = 0;
pub const PARAM_ID_GFP_2048_224: u8 = 1;
pub const PARAM_ID_GFP_2048_256: u8 = 2;
pub const PARAM_ID_ECP_NIST_P192_R1: u8 = 8;
pub const PARAM_ID_ECP_BRAINPOOL_P192_R1: u8 = 9;
pub const PARAM_ID_ECP_NIST_P224_R1: u8 = 10;
pub const PARAM_ID_ECP_BRAINPOOL_P224_R1: u8 = 11;
pub const PARAM_ID_ECP_NIST_P256_R1: u8 = 12;
pub const PARAM_ID_ECP_BRAINPOOL_P256_R1: u8 = 13;
pub const PARAM_ID_ECP_BRAINPOOL_P320_R1: u8 = 14;
pub const PARAM_ID_ECP_NIST_P384_R1: u8 = 15;
pub const PARAM_ID_ECP_BRAINPOOL_P384_R1: u8 = 16;
pub const PARAM_ID_ECP_BRAINPOOL_P512_R1: u8 = 17;
pub const PARAM_ID_ECP_NIST_P521_R1: u8 = 18;

/// PACE standardized domain parameters referenced by a `parameterId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainParameterSpec {
    Gfp(DhGroup),
    Ecp(EcCurve),
}

/// A finite field Diffie-Hellman group from RFC 5114.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    pub p: Vec<u8>,
    pub g: Vec<u8>,
    pub q: Vec<u8>,
}

/// A named prime field elliptic curve in short Weierstrass form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcCurve {
    pub name: &'static str,
    pub field_bits: usize,
    pub p: Vec<u8>,
    pub a: Vec<u8>,
    pub b: Vec<u8>,
    pub gx: Vec<u8>,
    pub gy: Vec<u8>,
    pub n: Vec<u8>,
    pub cofactor: u32,
}

struct DhGroupConstants {
    p: &'static str,
    g: &'static str,
    q: &'static str,
}

struct EcCurveConstants {
    name: &'static str,
    field_bits: usize,
    p: &'static str,
    a: &'static str,
    b: &'static str,
    gx: &'static str,
    gy: &'static str,
    n: &'static str,
}

// RFC 5114 section 2.1.
const MODP_1024_160: DhGroupConstants = DhGroupConstants {
    p: "B10B8F96A080E01DDE92DE5EAE5D54EC52C99FBCFB06A3C69A6A9DCA52D23B616073E28675A23D189838EF1E2EE652C013ECB4AEA906112324975C3CD49B83BFACCBDD7D90C4BD7098488E9C219A73724EFFD6FAE5644738FAA31A4FF55BCCC0A151AF5F0DC8B4BD45BF37DF365C1A65E68CFDA76D4DA708DF1FB2BC2E4A4371",
    g: "A4D1CBD5C3FD34126765A442EFB99905F8104DD258AC507FD6406CFF14266D31266FEA1E5C41564B777E690F5504F213160217B4B01B886A5E91547F9E2749F4D7FBD7D3B9A92EE1909D0D2263F80A76A6A24C087A091F531DBF0A0169B6A28AD662A4D18E73AFA32D779D5918D08BC8858F4DCEF97C2A24855E6EEB22B3B2E5",
    q: "F518AA8781A8DF278ABA4E7D64B7CB9D49462353",
};

// RFC 5114 section 2.2.
const MODP_2048_224: DhGroupConstants = DhGroupConstants {
    p: "AD107E1E9123A9D0D660FAA79559C51FA20D64E5683B9FD1B54B1597B61D0A75E6FA141DF95A56DBAF9A3C407BA1DF15EB3D688A309C180E1DE6B85A1274A0A66D3F8152AD6AC2129037C9EDEFDA4DF8D91E8FEF55B7394B7AD5B7D0B6C12207C9F98D11ED34DBF6C6BA0B2C8BBC27BE6A00E0A0B9C49708B3BF8A317091883681286130BC8985DB1602E714415D9330278273C7DE31EFDC7310F7121FD5A07415987D9ADC0A486DCDF93ACC44328387315D75E198C641A480CD86A1B9E587E8BE60E69CC928B2B9C52172E413042E9B23F10B0E16E79763C9B53DCF4BA80A29E3FB73C16B8E75B97EF363E2FFA31F71CF9DE5384E71B81C0AC4DFFE0C10E64F",
    g: "AC4032EF4F2D9AE39DF30B5C8FFDAC506CDEBE7B89998CAF74866A08CFE4FFE3A6824A4E10B9A6F0DD921F01A70C4AFAAB739D7700C29F52C57DB17C620A8652BE5E9001A8D66AD7C17669101999024AF4D027275AC1348BB8A762D0521BC98AE247150422EA1ED409939D54DA7460CDB5F6C6B250717CBEF180EB34118E98D119529A45D6F834566E3025E316A330EFBB77A86F0C1AB15B051AE3D428C8F8ACB70A8137150B8EEB10E183EDD19963DDD9E263E4770589EF6AA21E7F5F2FF381B539CCE3409D13CD566AFBB48D6C019181E1BCFE94B30269EDFE72FE9B6AA4BD7B5A0F1C71CFFF4C19C418E1F6EC017981BC087F2A7065B384B890D3191F2BFA",
    q: "801C0D34C58D93FE997177101F80535A4738CEBCBF389A99B36371EB",
};

// RFC 5114 section 2.3.
const MODP_2048_256: DhGroupConstants = DhGroupConstants {
    p: "87A8E61DB4B6663CFFBBD19C651959998CEEF608660DD0F25D2CEED4435E3B00E00DF8F1D61957D4FAF7DF4561B2AA3016C3D91134096FAA3BF4296D830E9A7C209E0C6497517ABD5A8A9D306BCF67ED91F9E6725B4758C022E0B1EF4275BF7B6C5BFC11D45F9088B941F54EB1E59BB8BC39A0BF12307F5C4FDB70C581B23F76B63ACAE1CAA6B7902D52526735488A0EF13C6D9A51BFA4AB3AD8347796524D8EF6A167B5A41825D967E144E5140564251CCACB83E6B486F6B3CA3F7971506026C0B857F689962856DED4010ABD0BE621C3A3960A54E710C375F26375D7014103A4B54330C198AF126116D2276E11715F693877FAD7EF09CADB094AE91E1A1597",
    g: "3FB32C9B73134D0B2E77506660EDBD484CA7B18F21EF205407F4793A1A0BA12510DBC15077BE463FFF4FED4AAC0BB555BE3A6C1B0C6B47B1BC3773BF7E8C6F62901228F8C28CBB18A55AE31341000A650196F931C77A57F2DDF463E5E9EC144B777DE62AAAB8A8628AC376D282D6ED3864E67982428EBC831D14348F6F2F9193B5045AF2767164E1DFC967C1FB3F2E55A4BD1BFFE83B9C80D052B985D182EA0ADB2A3B7313D3FE14C8484B1E052588B9B7D2BBD2DF016199ECD06E1557CD0915B3353BBB64E0EC377FD028370DF92B52C7891428CDC67EB6184B523D1DB246C32F63078490F00EF8D647D148D47954515E2327CFEF98C582664B4C0F6CC41659",
    q: "8CF83642A709A097B447997640129DA299B1A47D1EB3750BA308B0FE64F5FBD3",
};

const SECP192R1: EcCurveConstants = EcCurveConstants {
    name: "secp192r1",
    field_bits: 192,
    p: "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFFFFFFFFFFFF",
    a: "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFFFFFFFFFFFC",
    b: "64210519E59C80E70FA7E9AB72243049FEB8DEECC146B9B1",
    gx: "188DA80EB03090F67CBF20EB43A18800F4FF0AFD82FF1012",
    gy: "07192B95FFC8DA78631011ED6B24CDD573F977A11E794811",
    n: "FFFFFFFFFFFFFFFFFFFFFFFF99DEF836146BC9B1B4D22831",
};

const BRAINPOOL_P192R1: EcCurveConstants = EcCurveConstants {
    name: "brainpoolp192r1",
    field_bits: 192,
    p: "C302F41D932A36CDA7A3463093D18DB78FCE476DE1A86297",
    a: "6A91174076B1E0E19C39C031FE8685C1CAE040E5C69A28EF",
    b: "469A28EF7C28CCA3DC721D044F4496BCCA7EF4146FBF25C9",
    gx: "C0A0647EAAB6A48753B033C56CB0F0900A2F5C4853375FD6",
    gy: "14B690866ABD5BB88B5F4828C1490002E6773FA2FA299B8F",
    n: "C302F41D932A36CDA7A3462F9E9E916B5BE8F1029AC4ACC1",
};

const SECP224R1: EcCurveConstants = EcCurveConstants {
    name: "secp224r1",
    field_bits: 224,
    p: "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF000000000000000000000001",
    a: "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFFFFFFFFFFFFFFFFFFFE",
    b: "B4050A850C04B3ABF54132565044B0B7D7BFD8BA270B39432355FFB4",
    gx: "B70E0CBD6BB4BF7F321390B94A03C1D356C21122343280D6115C1D21",
    gy: "BD376388B5F723FB4C22DFE6CD4375A05A07476444D5819985007E34",
    n: "FFFFFFFFFFFFFFFFFFFFFFFFFFFF16A2E0B8F03E13DD29455C5C2A3D",
};

const BRAINPOOL_P224R1: EcCurveConstants = EcCurveConstants {
    name: "brainpoolp224r1",
    field_bits: 224,
    p: "D7C134AA264366862A18302575D1D787B09F075797DA89F57EC8C0FF",
    a: "68A5E62CA9CE6C1C299803A6C1530B514E182AD8B0042A59CAD29F43",
    b: "2580F63CCFE44138870713B1A92369E33E2135D266DBB372386C400B",
    gx: "0D9029AD2C7E5CF4340823B2A87DC68C9E4CE3174C1E6EFDEE12C07D",
    gy: "58AA56F772C0726F24C6B89E4ECDAC24354B9E99CAA3F6D3761402CD",
    n: "D7C134AA264366862A18302575D0FB98D116BC4B6DDEBCA3A5A7939F",
};

const SECP256R1: EcCurveConstants = EcCurveConstants {
    name: "secp256r1",
    field_bits: 256,
    p: "FFFFFFFF00000001000000000000000000000000FFFFFFFFFFFFFFFFFFFFFFFF",
    a: "FFFFFFFF00000001000000000000000000000000FFFFFFFFFFFFFFFFFFFFFFFC",
    b: "5AC635D8AA3A93E7B3EBBD55769886BC651D06B0CC53B0F63BCE3C3E27D2604B",
    gx: "6B17D1F2E12C4247F8BCE6E563A440F277037D812DEB33A0F4A13945D898C296",
    gy: "4FE342E2FE1A7F9B8EE7EB4A7C0F9E162BCE33576B315ECECBB6406837BF51F5",
    n: "FFFFFFFF00000000FFFFFFFFFFFFFFFFBCE6FAADA7179E84F3B9CAC2FC632551",
};

const BRAINPOOL_P256R1: EcCurveConstants = EcCurveConstants {
    name: "brainpoolp256r1",
    field_bits: 256,
    p: "A9FB57DBA1EEA9BC3E660A909D838D726E3BF623D52620282013481D1F6E5377",
    a: "7D5A0975FC2C3057EEF67530417AFFE7FB8055C126DC5C6CE94A4B44F330B5D9",
    b: "26DC5C6CE94A4B44F330B5D9BBD77CBF958416295CF7E1CE6BCCDC18FF8C07B6",
    gx: "8BD2AEB9CB7E57CB2C4B482FFC81B7AFB9DE27E1E3BD23C23A4453BD9ACE3262",
    gy: "547EF835C3DAC4FD97F8461A14611DC9C27745132DED8E545C1D54C72F046997",
    n: "A9FB57DBA1EEA9BC3E660A909D838D718C397AA3B561A6F7901E0E82974856A7",
};

const BRAINPOOL_P320R1: EcCurveConstants = EcCurveConstants {
    name: "brainpoolp320r1",
    field_bits: 320,
    p: "D35E472036BC4FB7E13C785ED201E065F98FCFA6F6F40DEF4F92B9EC7893EC28FCD412B1F1B32E27",
    a: "3EE30B568FBAB0F883CCEBD46D3F3BB8A2A73513F5EB79DA66190EB085FFA9F492F375A97D860EB4",
    b: "520883949DFDBC42D3AD198640688A6FE13F41349554B49ACC31DCCD884539816F5EB4AC8FB1F1A6",
    gx: "43BD7E9AFB53D8B85289BCC48EE5BFE6F20137D10A087EB6E7871E2A10A599C710AF8D0D39E20611",
    gy: "14FDD05545EC1CC8AB4093247F77275E0743FFED117182EAA9C77877AAAC6AC7D35245D1692E8EE1",
    n: "D35E472036BC4FB7E13C785ED201E065F98FCFA5B68F12A32D482EC7EE8658E98691555B44C59311",
};

const SECP384R1: EcCurveConstants = EcCurveConstants {
    name: "secp384r1",
    field_bits: 384,
    p: "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFFFF0000000000000000FFFFFFFF",
    a: "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEFFFFFFFF0000000000000000FFFFFFFC",
    b: "B3312FA7E23EE7E4988E056BE3F82D19181D9C6EFE8141120314088F5013875AC656398D8A2ED19D2A85C8EDD3EC2AEF",
    gx: "AA87CA22BE8B05378EB1C71EF320AD746E1D3B628BA79B9859F741E082542A385502F25DBF55296C3A545E3872760AB7",
    gy: "3617DE4A96262C6F5D9E98BF9292DC29F8F41DBD289A147CE9DA3113B5F0B8C00A60B1CE1D7E819D7A431D7C90EA0E5F",
    n: "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFC7634D81F4372DDF581A0DB248B0A77AECEC196ACCC52973",
};

const BRAINPOOL_P384R1: EcCurveConstants = EcCurveConstants {
    name: "brainpoolp384r1",
    field_bits: 384,
    p: "8CB91E82A3386D280F5D6F7E50E641DF152F7109ED5456B412B1DA197FB71123ACD3A729901D1A71874700133107EC53",
    a: "7BC382C63D8C150C3C72080ACE05AFA0C2BEA28E4FB22787139165EFBA91F90F8AA5814A503AD4EB04A8C7DD22CE2826",
    b: "04A8C7DD22CE28268B39B55416F0447C2FB77DE107DCD2A62E880EA53EEB62D57CB4390295DBC9943AB78696FA504C11",
    gx: "1D1C64F068CF45FFA2A63A81B7C13F6B8847A3E77EF14FE3DB7FCAFE0CBD10E8E826E03436D646AAEF87B2E247D4AF1E",
    gy: "8ABE1D7520F9C2A45CB1EB8E95CFD55262B70B29FEEC5864E19C054FF99129280E4646217791811142820341263C5315",
    n: "8CB91E82A3386D280F5D6F7E50E641DF152F7109ED5456B31F166E6CAC0425A7CF3AB6AF6B7FC3103B883202E9046565",
};

const BRAINPOOL_P512R1: EcCurveConstants = EcCurveConstants {
    name: "brainpoolp512r1",
    field_bits: 512,
    p: "AADD9DB8DBE9C48B3FD4E6AE33C9FC07CB308DB3B3C9D20ED6639CCA703308717D4D9B009BC66842AECDA12AE6A380E62881FF2F2D82C68528AA6056583A48F3",
    a: "7830A3318B603B89E2327145AC234CC594CBDD8D3DF91610A83441CAEA9863BC2DED5D5AA8253AA10A2EF1C98B9AC8B57F1117A72BF2C7B9E7C1AC4D77FC94CA",
    b: "3DF91610A83441CAEA9863BC2DED5D5AA8253AA10A2EF1C98B9AC8B57F1117A72BF2C7B9E7C1AC4D77FC94CADC083E67984050B75EBAE5DD2809BD638016F723",
    gx: "81AEE4BDD82ED9645A21322E9C4C6A9385ED9F70B5D916C1B43B62EEF4D0098EFF3B1F78E2D0D48D50D1687B93B97D5F7C6D5047406A5E688B352209BCB9F822",
    gy: "7DDE385D566332ECC0EABFA9CF7822FDF209F70024A57B1AA000C55B881F8111B2DCDE494A5F485E5BCA4BD88A2763AED1CA2B2FA8F0540678CD1E0F3AD80892",
    n: "AADD9DB8DBE9C48B3FD4E6AE33C9FC07CB308DB3B3C9D20ED6639CCA70330870553E5C414CA92619418661197FAC10471DB1D381085DDADDB58796829CA90069",
};

const SECP521R1: EcCurveConstants = EcCurveConstants {
    name: "secp521r1",
    field_bits: 521,
    p: "01FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF",
    a: "01FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFC",
    b: "51953EB9618E1C9A1F929A21A0B68540EEA2DA725B99B315F3B8B489918EF109E156193951EC7E937B1652C0BD3BB1BF073573DF883D2C34F1EF451FD46B503F00",
    gx: "00C6858E06B70404E9CD9E3ECB662395B4429C648139053FB521F828AF606B4D3DBAA14B5E77EFE75928FE1DC127A2FFA8DE3348B3C1856A429BF97E7E31C2E5BD66",
    gy: "011839296A789A3BC0045C8A5FB42C7D1BD998F54449579B446817AFBD17273E662C97EE72995EF42640C550B9013FAD0761353C7086A272C24088BE94769FD16650",
    n: "01FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFA51868783BF2F966B7FCC0148F709A5D03BB5C9B8899C47AEBB6FB71E91386409",
};

fn gfp_spec(group: &DhGroupConstants) -> Result<DomainParameterSpec, EmrtdError> {
    Ok(DomainParameterSpec::Gfp(DhGroup {
        p: hex2bytes(group.p)?,
        g: hex2bytes(group.g)?,
        q: hex2bytes(group.q)?,
    }))
}

fn ecp_spec(curve: &EcCurveConstants) -> Result<DomainParameterSpec, EmrtdError> {
    Ok(DomainParameterSpec::Ecp(EcCurve {
        name: curve.name,
        field_bits: curve.field_bits,
        p: hex2bytes(curve.p)?,
        a: hex2bytes(curve.a)?,
        b: hex2bytes(curve.b)?,
        gx: hex2bytes(curve.gx)?,
        gy: hex2bytes(curve.gy)?,
        n: hex2bytes(curve.n)?,
        cofactor: 1,
    }))
}

/// Resolves a PACE `parameterId` to its standardized domain parameters per
/// ICAO Doc 9303-11 section 9.5.1.
///
/// Ids `0` to `2` are the RFC 5114 MODP groups, `8` to `18` are named prime
/// field curves.
///
/// # Errors
///
/// `EmrtdError::ParseDataError` if the id is reserved (`3` to `7`) or
/// unknown.
pub fn get_parameter_spec(parameter_id: u8) -> Result<DomainParameterSpec, EmrtdError> {
    match parameter_id {
        PARAM_ID_GFP_1024_160 => gfp_spec(&MODP_1024_160),
        PARAM_ID_GFP_2048_224 => gfp_spec(&MODP_2048_224),
        PARAM_ID_GFP_2048_256 => gfp_spec(&MODP_2048_256),
        PARAM_ID_ECP_NIST_P192_R1 => ecp_spec(&SECP192R1),
        PARAM_ID_ECP_BRAINPOOL_P192_R1 => ecp_spec(&BRAINPOOL_P192R1),
        PARAM_ID_ECP_NIST_P224_R1 => ecp_spec(&SECP224R1),
        PARAM_ID_ECP_BRAINPOOL_P224_R1 => ecp_spec(&BRAINPOOL_P224R1),
        PARAM_ID_ECP_NIST_P256_R1 => ecp_spec(&SECP256R1),
        PARAM_ID_ECP_BRAINPOOL_P256_R1 => ecp_spec(&BRAINPOOL_P256R1),
        PARAM_ID_ECP_BRAINPOOL_P320_R1 => ecp_spec(&BRAINPOOL_P320R1),
        PARAM_ID_ECP_NIST_P384_R1 => ecp_spec(&SECP384R1),
        PARAM_ID_ECP_BRAINPOOL_P384_R1 => ecp_spec(&BRAINPOOL_P384R1),
        PARAM_ID_ECP_BRAINPOOL_P512_R1 => ecp_spec(&BRAINPOOL_P512R1),
        PARAM_ID_ECP_NIST_P521_R1 => ecp_spec(&SECP521R1),
        3..=7 => Err(EmrtdError::ParseDataError(format!(
            "PACE parameter id {parameter_id} is reserved for future use"
        ))),
        _ => Err(EmrtdError::ParseDataError(format!(
            "unknown PACE parameter id {parameter_id}"
        ))),
    }
}

/// A decoded `PACEInfo` entry from `EF.CardAccess`.
///
/// Carries the protocol variant, the protocol version (always `2`) and an
/// optional reference to standardized domain parameters. Validation happens
/// at construction, so an existing value is always internally consistent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaceInfo {
    protocol: PaceProtocol,
    version: u8,
    parameter_id: Option<u8>,
}

impl PaceInfo {
    /// Creates a `PaceInfo` from a protocol OID, version and parameter id.
    ///
    /// # Errors
    ///
    /// `EmrtdError::InvalidOidError` if the OID is not a PACE protocol OID,
    /// `EmrtdError::InvalidArgument` if the version is not `2` or the
    /// parameter id does not match the protocol's key agreement algorithm
    /// (`0..=2` for DH, `8..=18` for ECDH).
    pub fn new(oid: &str, version: u8, parameter_id: Option<u8>) -> Result<Self, EmrtdError> {
        let protocol = PaceProtocol::from_oid(oid)?;
        if version != 2 {
            error!("Unsupported PACE version {version}, only version 2 exists");
            return Err(EmrtdError::InvalidArgument("PACE version must be 2"));
        }
        if let Some(id) = parameter_id {
            let in_range = match protocol.key_agreement {
                KeyAgreement::Dh => (0..=2).contains(&id),
                KeyAgreement::Ecdh => (8..=18).contains(&id),
            };
            if !in_range {
                error!(
                    "PACE parameter id {id} does not belong to {}",
                    protocol.key_agreement
                );
                return Err(EmrtdError::InvalidArgument(
                    "parameter id does not match the key agreement algorithm",
                ));
            }
        }
        Ok(Self {
            protocol,
            version,
            parameter_id,
        })
    }

    #[must_use]
    pub fn protocol(&self) -> PaceProtocol {
        self.protocol
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[must_use]
    pub fn parameter_id(&self) -> Option<u8> {
        self.parameter_id
    }

    /// Returns the dotted-decimal protocol OID.
    #[must_use]
    pub fn object_identifier(&self) -> String {
        self.protocol.oid()
    }

    /// Returns the symbolic name of the protocol OID, for example
    /// `id-PACE-ECDH-GM-AES-CBC-CMAC-256`.
    #[must_use]
    pub fn protocol_oid_string(&self) -> String {
        self.protocol.to_string()
    }

    /// Resolves this entry's parameter id to domain parameters.
    ///
    /// # Errors
    ///
    /// `EmrtdError::InvalidArgument` if the entry carries no parameter id.
    pub fn to_parameter_spec(&self) -> Result<DomainParameterSpec, EmrtdError> {
        match self.parameter_id {
            Some(id) => get_parameter_spec(id),
            None => Err(EmrtdError::InvalidArgument(
                "PACEInfo carries no parameter id",
            )),
        }
    }
}

impl fmt::Display for PaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.parameter_id {
            Some(id) => write!(
                f,
                "PaceInfo [protocol: {}, version: {}, parameter id: {}]",
                self.protocol, self.version, id
            ),
            None => write!(
                f,
                "PaceInfo [protocol: {}, version: {}]",
                self.protocol, self.version
            ),
        }
    }
}

/// An elementary file payload that can be decoded from and encoded to the
/// bytes stored on the chip.
pub trait LdsFile: Sized {
    /// Parses the file content read from the chip.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the content does not match the file's structure.
    fn decode(data: &[u8]) -> Result<Self, EmrtdError>;

    /// Serializes the file to the byte layout stored on the chip.
    fn encode(&self) -> Vec<u8>;
}

/// Tag of a certification authority reference inside `EF.CVCA`.
pub const CAR_TAG: u8 = 0x42;

/// `EF.CVCA` always occupies 36 bytes on the chip, unused space is
/// zero-padded.
pub const CVCA_FILE_LENGTH: usize = 36;

/// The `EF.CVCA` file, see BSI TR-03110 and ICAO Doc 9303-11 section 7.1.
///
/// Holds the reference of the CVCA root certificate a terminal must chain
/// its card verifiable certificates to, plus an optional alternate reference
/// used during CVCA link certificate rollover.
///
/// A tagged but empty second reference decodes to `Some("")`, an absent one
/// to `None`; the two serialize differently and are kept distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CVCAFile {
    ca_reference: String,
    alt_ca_reference: Option<String>,
}

impl CVCAFile {
    /// Creates an `EF.CVCA` payload from one or two CA references.
    ///
    /// # Errors
    ///
    /// `EmrtdError::InvalidArgument` if a reference is longer than 16
    /// characters or not ASCII.
    pub fn new(ca_reference: &str, alt_ca_reference: Option<&str>) -> Result<Self, EmrtdError> {
        check_ca_reference(ca_reference)?;
        if let Some(alt) = alt_ca_reference {
            check_ca_reference(alt)?;
        }
        Ok(Self {
            ca_reference: ca_reference.to_owned(),
            alt_ca_reference: alt_ca_reference.map(str::to_owned),
        })
    }

    #[must_use]
    pub fn ca_reference(&self) -> &str {
        &self.ca_reference
    }

    #[must_use]
    pub fn alt_ca_reference(&self) -> Option<&str> {
        self.alt_ca_reference.as_deref()
    }
}

fn check_ca_reference(reference: &str) -> Result<(), EmrtdError> {
    if reference.len() > 16 {
        return Err(EmrtdError::InvalidArgument(
            "CA reference must be at most 16 characters",
        ));
    }
    if !reference.is_ascii() {
        return Err(EmrtdError::InvalidArgument("CA reference must be ASCII"));
    }
    Ok(())
}

fn read_ca_reference(data: &[u8]) -> Result<(String, &[u8]), EmrtdError> {
    let Some((&CAR_TAG, rest)) = data.split_first() else {
        error!("EF.CVCA does not start with a CA reference tag");
        return Err(EmrtdError::InvalidFileStructure("wrong CA reference tag"));
    };
    let Some((&length, rest)) = rest.split_first() else {
        return Err(EmrtdError::InvalidFileStructure("truncated CA reference"));
    };
    let length = length as usize;
    if length > 16 {
        return Err(EmrtdError::InvalidFileStructure("CA reference too long"));
    }
    if rest.len() < length {
        return Err(EmrtdError::InvalidFileStructure("truncated CA reference"));
    }
    let (reference, rest) = rest.split_at(length);
    if !reference.is_ascii() {
        return Err(EmrtdError::InvalidFileStructure(
            "CA reference is not ASCII",
        ));
    }
    Ok((String::from_utf8_lossy(reference).into_owned(), rest))
}

impl LdsFile for CVCAFile {
    fn decode(data: &[u8]) -> Result<Self, EmrtdError> {
        let (ca_reference, rest) = read_ca_reference(data)?;
        let (alt_ca_reference, rest) = match rest.first() {
            Some(&CAR_TAG) => {
                let (alt, rest) = read_ca_reference(rest)?;
                (Some(alt), rest)
            }
            Some(&0x00) | None => (None, rest),
            Some(_) => {
                error!("EF.CVCA has a stray tag after the CA reference");
                return Err(EmrtdError::InvalidFileStructure("wrong CA reference tag"));
            }
        };
        if rest.iter().any(|&byte| byte != 0) {
            error!("EF.CVCA has non-zero bytes after the CA references");
            return Err(EmrtdError::InvalidFileStructure("bad file padding"));
        }
        Ok(Self {
            ca_reference,
            alt_ca_reference,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(CVCA_FILE_LENGTH);
        encoded.push(CAR_TAG);
        // Lengths were checked at construction, they always fit one byte.
        encoded.push(self.ca_reference.len() as u8);
        encoded.extend_from_slice(self.ca_reference.as_bytes());
        if let Some(alt) = &self.alt_ca_reference {
            encoded.push(CAR_TAG);
            encoded.push(alt.len() as u8);
            encoded.extend_from_slice(alt.as_bytes());
        }
        encoded.resize(CVCA_FILE_LENGTH, 0x00);
        encoded
    }
}

impl fmt::Display for CVCAFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.alt_ca_reference {
            Some(alt) => write!(
                f,
                "CVCAFile [CA reference: {}, alternate CA reference: {}]",
                self.ca_reference, alt
            ),
            None => write!(f, "CVCAFile [CA reference: {}]", self.ca_reference),
        }
    }
}

const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;

/// A command APDU, see ISO/IEC 7816-4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct APDU {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    lc: Option<Vec<u8>>,
    cdata: Option<Vec<u8>>,
    le: Option<Vec<u8>>,
}

impl APDU {
    /// Creates a new APDU, validating the `Lc`/`Le` field length combination
    /// against the four ISO/IEC 7816-4 APDU cases, short and extended.
    ///
    /// # Panics
    ///
    /// Panics if the `Lc`/`Le` combination is not a valid APDU case or if
    /// only one of `lc` and `cdata` is given.
    #[must_use]
    pub fn new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        lc: Option<Vec<u8>>,
        cdata: Option<Vec<u8>>,
        le: Option<Vec<u8>>,
    ) -> Self {
        assert_eq!(
            lc.is_some(),
            cdata.is_some(),
            "Lc must be given together with command data"
        );
        match (lc.as_ref().map(Vec::len), le.as_ref().map(Vec::len)) {
            (None | Some(1 | 3), None)
            | (None | Some(1), Some(1))
            | (Some(3), Some(2))
            | (None, Some(3)) => {}
            _ => panic!("Invalid Lc or Le length"),
        }
        Self {
            cla,
            ins,
            p1,
            p2,
            lc,
            cdata,
            le,
        }
    }

    /// Returns `[CLA, INS, P1, P2]`.
    #[must_use]
    pub fn get_command_header(&self) -> Vec<u8> {
        vec![self.cla, self.ins, self.p1, self.p2]
    }

    #[must_use]
    pub fn cla(&self) -> u8 {
        self.cla
    }

    #[must_use]
    pub fn ins(&self) -> u8 {
        self.ins
    }

    #[must_use]
    pub fn p1(&self) -> u8 {
        self.p1
    }

    #[must_use]
    pub fn p2(&self) -> u8 {
        self.p2
    }

    #[must_use]
    pub fn lc(&self) -> Option<&[u8]> {
        self.lc.as_deref()
    }

    #[must_use]
    pub fn cdata(&self) -> Option<&[u8]> {
        self.cdata.as_deref()
    }

    #[must_use]
    pub fn le(&self) -> Option<&[u8]> {
        self.le.as_deref()
    }
}

/// A smart card that can exchange APDUs.
pub trait EmrtdCard {
    /// Transmits `send_buffer` to the card and returns the slice of
    /// `receive_buffer` holding the card's response.
    ///
    /// # Errors
    ///
    /// `pcsc::Error` if the transmission fails.
    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error>;
}

impl EmrtdCard for pcsc::Card {
    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error> {
        self.transmit(send_buffer, receive_buffer)
    }
}

impl<T: EmrtdCard + ?Sized> EmrtdCard for &T {
    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error> {
        (**self).transmit(send_buffer, receive_buffer)
    }
}

/// An established secure messaging session.
///
/// Implementations hold the session keys and the send sequence counter
/// negotiated by BAC or PACE. The counter advances once per wrapped command
/// and once per unwrapped response, which is why both methods take `&mut
/// self` and why [`EmrtdComms`] serializes every exchange.
pub trait SecureMessaging {
    /// Protects a command APDU, returning the bytes to put on the wire.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the APDU can not be protected, for example on send
    /// sequence counter overflow.
    fn wrap(&mut self, apdu: &APDU) -> Result<Vec<u8>, EmrtdError>;

    /// Removes protection from a response APDU, without its trailing status
    /// word, and returns the plain response data.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the response is malformed or its MAC does not verify.
    fn unwrap(&mut self, rapdu: &[u8]) -> Result<Vec<u8>, EmrtdError>;
}

struct CommsInner<C, W, R> {
    card: C,
    sm: W,
    rng: R,
}

/// Drives APDU exchanges with the chip over an established secure messaging
/// session.
///
/// The card and the session wrapper live behind one lock, so concurrent
/// callers are serialized and every response is unwrapped by the same
/// session state that wrapped its command. All methods take `&self`; sharing
/// an `EmrtdComms` between threads needs no external synchronization.
pub struct EmrtdComms<C: EmrtdCard, W: SecureMessaging, R: RngCore + CryptoRng + Default = OsRng> {
    inner: Mutex<CommsInner<C, W, R>>,
}

impl<C: EmrtdCard, W: SecureMessaging, R: RngCore + CryptoRng + Default> EmrtdComms<C, W, R> {
    #[must_use]
    pub fn new(card: C, sm: W) -> Self {
        Self {
            inner: Mutex::new(CommsInner {
                card,
                sm,
                rng: R::default(),
            }),
        }
    }

    /// Generates a fresh 8 byte challenge for Active Authentication.
    pub fn generate_challenge(&self) -> [u8; 8] {
        let mut inner = self.inner.lock().expect("card session lock poisoned");
        let mut rnd_ifd = [0; 8];
        inner.rng.fill_bytes(&mut rnd_ifd);
        rnd_ifd
    }

    /// Sends `INTERNAL AUTHENTICATE` with an 8 byte challenge and returns the
    /// chip's signature, see ICAO Doc 9303-11 section 6.1.
    ///
    /// The command is first sent with a short `Le`. If the chip answers with
    /// `SW1 = 0x61` (more data available) the command is retried once with
    /// extended length, and the longer of the two responses wins. A response
    /// with data under an unexpected status word is returned with a warning,
    /// some chips signal success this way.
    ///
    /// # Arguments
    ///
    /// * `rnd_ifd` - The 8 byte challenge to be signed by the chip.
    ///
    /// # Errors
    ///
    /// `EmrtdError::InvalidArgument` if the challenge is not 8 bytes,
    /// `EmrtdError::RecvApduError` if the chip returns an error status word
    /// and no data, `EmrtdError::PcscError` if a transmission fails.
    pub fn send_internal_authenticate(&self, rnd_ifd: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        if rnd_ifd.len() != 8 {
            error!(
                "INTERNAL AUTHENTICATE needs an 8 byte challenge, got {} bytes",
                rnd_ifd.len()
            );
            return Err(EmrtdError::InvalidArgument("challenge must be 8 bytes"));
        }

        let mut inner = self.inner.lock().expect("card session lock poisoned");

        info!("Sending INTERNAL AUTHENTICATE");
        let apdu = APDU::new(
            0x00,
            INS_INTERNAL_AUTHENTICATE,
            0x00,
            0x00,
            Some(vec![0x08]),
            Some(rnd_ifd.to_vec()),
            Some(vec![0x00]),
        );
        let (data, status) = Self::transmit_wrapped(&mut inner, &apdu)?;

        match status {
            [0x90, 0x00] => Ok(data),
            [0x61, _] => {
                trace!("Response data remains, retrying INTERNAL AUTHENTICATE with extended length");
                let apdu = APDU::new(
                    0x00,
                    INS_INTERNAL_AUTHENTICATE,
                    0x00,
                    0x00,
                    Some(vec![0x00, 0x00, 0x08]),
                    Some(rnd_ifd.to_vec()),
                    Some(vec![0x00, 0x00]),
                );
                let (extended_data, _) = Self::transmit_wrapped(&mut inner, &apdu)?;
                match (data.is_empty(), extended_data.is_empty()) {
                    (true, true) => {
                        error!(
                            "INTERNAL AUTHENTICATE returned no data, SW1: {:02X}, SW2: {:02X}",
                            status[0], status[1]
                        );
                        Err(EmrtdError::RecvApduError(status[0], status[1]))
                    }
                    (false, true) => Ok(data),
                    (true, false) => Ok(extended_data),
                    // On equal lengths the extended response wins, it is
                    // assumed to be a superset of the short one.
                    (false, false) => {
                        if data.len() > extended_data.len() {
                            Ok(data)
                        } else {
                            Ok(extended_data)
                        }
                    }
                }
            }
            [sw1, sw2] => {
                if data.is_empty() {
                    error!("INTERNAL AUTHENTICATE failed, SW1: {sw1:02X}, SW2: {sw2:02X}");
                    Err(EmrtdError::RecvApduError(sw1, sw2))
                } else {
                    warn!(
                        "INTERNAL AUTHENTICATE returned data under SW1: {sw1:02X}, SW2: {sw2:02X}, accepting it"
                    );
                    Ok(data)
                }
            }
        }
    }

    /// Wraps the APDU, transmits it and unwraps the response. Returns the
    /// plain response data and the status word.
    fn transmit_wrapped(
        inner: &mut CommsInner<C, W, R>,
        apdu: &APDU,
    ) -> Result<(Vec<u8>, [u8; 2]), EmrtdError> {
        let protected = inner.sm.wrap(apdu)?;
        trace!("Sending protected APDU: {}", bytes2hex(&protected));

        let mut response_buffer = vec![0; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = inner
            .card
            .transmit(&protected, &mut response_buffer)
            .map_err(EmrtdError::PcscError)?;
        if response.len() < 2 {
            error!("Card response is shorter than a status word");
            return Err(EmrtdError::InvalidResponseError());
        }
        let status: [u8; 2] = [response[response.len() - 2], response[response.len() - 1]];
        let data = inner.sm.unwrap(&response[..response.len() - 2])?;
        trace!(
            "Received response SW1: {:02X}, SW2: {:02X}, data: {}",
            status[0],
            status[1],
            bytes2hex(&data)
        );
        Ok((data, status))
    }

    /// Consumes the session and returns the card and the wrapper.
    pub fn into_parts(self) -> (C, W) {
        let inner = self.inner.into_inner().expect("card session lock poisoned");
        (inner.card, inner.sm)
    }
}
