//! BIE1 integrated encryption over secp256k1.
//!
//! Output addresses travel through the shuffle wrapped in one BIE1 layer per
//! remaining player. A layer is produced as follows:
//!
//! ```text
//! e            = fresh ephemeral secret
//! S            = K * e                  (compressed, 33 bytes)
//! iv|kE|kM     = SHA-512(S)             (16 | 16 | 32 bytes)
//! ct           = AES-128-CBC-PKCS7(kE, iv, plaintext)
//! framed       = "BIE1" || E.pub || ct
//! output       = base64(framed || HMAC-SHA256(kM, framed))
//! ```
//!
//! Decryption checks the MAC before touching the ciphertext and reports every
//! failure as the same [`EncryptionError::InvalidCiphertext`].

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Magic prefix of every BIE1 payload
pub const BIE1_MAGIC: &[u8; 4] = b"BIE1";

const EPHEMERAL_KEY_LEN: usize = 33;
const MAC_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// Smallest well-formed payload: magic, ephemeral key, one block, MAC.
pub const MIN_PAYLOAD_LEN: usize = BIE1_MAGIC.len() + EPHEMERAL_KEY_LEN + BLOCK_LEN + MAC_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptionError {
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    #[error("key agreement failed")]
    KeyAgreement,
}

/// Encrypt `plaintext` to `recipient`, returning the base64 text form.
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<String, EncryptionError> {
    let mut ephemeral = SecretKey::new(&mut rand::thread_rng());
    let result = encrypt_with_ephemeral(plaintext, recipient, &ephemeral);
    ephemeral.non_secure_erase();
    result
}

fn encrypt_with_ephemeral(
    plaintext: &[u8],
    recipient: &PublicKey,
    ephemeral: &SecretKey,
) -> Result<String, EncryptionError> {
    let secp = Secp256k1::new();
    let ephemeral_pub = PublicKey::from_secret_key(&secp, ephemeral);
    let keys = derive_keys(recipient, ephemeral).map_err(|_| EncryptionError::KeyAgreement)?;

    let ciphertext = Aes128CbcEnc::new_from_slices(keys.enc_key(), keys.iv())
        .map_err(|_| EncryptionError::KeyAgreement)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut framed = Vec::with_capacity(MIN_PAYLOAD_LEN + ciphertext.len());
    framed.extend_from_slice(BIE1_MAGIC);
    framed.extend_from_slice(&ephemeral_pub.serialize());
    framed.extend_from_slice(&ciphertext);

    let mut mac =
        HmacSha256::new_from_slice(keys.mac_key()).map_err(|_| EncryptionError::KeyAgreement)?;
    mac.update(&framed);
    framed.extend_from_slice(&mac.finalize().into_bytes());

    Ok(STANDARD.encode(framed))
}

/// Decrypt a base64 BIE1 payload with the recipient's secret key.
pub fn decrypt(encoded: &str, secret: &SecretKey) -> Result<Vec<u8>, EncryptionError> {
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(|_| EncryptionError::InvalidCiphertext)?;
    if data.len() < MIN_PAYLOAD_LEN || &data[..BIE1_MAGIC.len()] != BIE1_MAGIC {
        return Err(EncryptionError::InvalidCiphertext);
    }

    let key_end = BIE1_MAGIC.len() + EPHEMERAL_KEY_LEN;
    let mac_start = data.len() - MAC_LEN;
    let ephemeral_pub = PublicKey::from_slice(&data[BIE1_MAGIC.len()..key_end])
        .map_err(|_| EncryptionError::InvalidCiphertext)?;
    let keys = derive_keys(&ephemeral_pub, secret)?;

    let mut mac =
        HmacSha256::new_from_slice(keys.mac_key()).map_err(|_| EncryptionError::InvalidCiphertext)?;
    mac.update(&data[..mac_start]);
    mac.verify_slice(&data[mac_start..])
        .map_err(|_| EncryptionError::InvalidCiphertext)?;

    Aes128CbcDec::new_from_slices(keys.enc_key(), keys.iv())
        .map_err(|_| EncryptionError::InvalidCiphertext)?
        .decrypt_padded_vec_mut::<Pkcs7>(&data[key_end..mac_start])
        .map_err(|_| EncryptionError::InvalidCiphertext)
}

/// SHA-512 of the compressed shared point, split into iv, cipher key and MAC key.
struct DerivedKeys(Zeroizing<[u8; 64]>);

impl DerivedKeys {
    fn iv(&self) -> &[u8] {
        &self.0[..16]
    }

    fn enc_key(&self) -> &[u8] {
        &self.0[16..32]
    }

    fn mac_key(&self) -> &[u8] {
        &self.0[32..]
    }
}

fn derive_keys(point: &PublicKey, secret: &SecretKey) -> Result<DerivedKeys, EncryptionError> {
    let secp = Secp256k1::verification_only();
    let shared = point
        .mul_tweak(&secp, &Scalar::from(*secret))
        .map_err(|_| EncryptionError::InvalidCiphertext)?;
    let mut material = Zeroizing::new([0u8; 64]);
    material.copy_from_slice(&Sha512::digest(shared.serialize()));
    Ok(DerivedKeys(material))
}
