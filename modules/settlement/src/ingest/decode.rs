//! Report payload decoding: AES-CBC/PKCS7 decryption and GZIP decompression

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use std::io::Read;

use crate::models::ReportDocument;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid base64 in {field}: {message}")]
    Base64 { field: &'static str, message: String },

    #[error("Unsupported key length: {0} bytes")]
    KeyLength(usize),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Decompression failed: {0}")]
    Decompress(#[from] std::io::Error),
}

pub fn decrypt_aes_cbc_pkcs7(key_b64: &str, iv_b64: &str, blob: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let key = STANDARD.decode(key_b64.trim()).map_err(|e| DecodeError::Base64 {
        field: "key",
        message: e.to_string(),
    })?;
    let iv = STANDARD.decode(iv_b64.trim()).map_err(|e| DecodeError::Base64 {
        field: "initializationVector",
        message: e.to_string(),
    })?;

    let decrypted = match key.len() {
        16 => Aes128CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| DecodeError::Decrypt(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(blob),
        24 => Aes192CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| DecodeError::Decrypt(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(blob),
        32 => Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|e| DecodeError::Decrypt(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(blob),
        other => return Err(DecodeError::KeyLength(other)),
    };

    decrypted.map_err(|e| DecodeError::Decrypt(e.to_string()))
}

pub fn gunzip(blob: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(blob);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Decrypt and decompress as the document descriptor requires, then decode
/// as UTF-8 (invalid sequences replaced)
pub fn decode_document(document: &ReportDocument, raw: Vec<u8>) -> Result<String, DecodeError> {
    let mut bytes = raw;

    if let Some(encryption) = &document.encryption_details {
        bytes = decrypt_aes_cbc_pkcs7(&encryption.key, &encryption.initialization_vector, &bytes)?;
    }

    if document.is_gzip() {
        bytes = gunzip(&bytes)?;
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
