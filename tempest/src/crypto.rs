//! Session cryptography: AES-256-CBC payload encryption, HMAC-SHA256
//! signing, and the asymmetric key interface used by the handshake.
//!
//! The symmetric side lives in [`SessionCrypto`], installed into both
//! framers once the handshake completes. The asymmetric side is kept
//! behind the [`AuthKey`] trait so the core never touches a concrete
//! RSA type outside [`RsaAuthKey`].

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::StdRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Hash algorithm negotiated for handshake signatures. SHA-1 stays
/// defined for peers that offer nothing better, but the default
/// preference list refuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningHash {
    Sha256,
    Sha1,
}

impl SigningHash {
    pub fn wire_name(self) -> &'static str {
        match self {
            SigningHash::Sha256 => "SHA256",
            SigningHash::Sha1 => "SHA1",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "SHA256" => Some(SigningHash::Sha256),
            "SHA1" => Some(SigningHash::Sha1),
            _ => None,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            SigningHash::Sha256 => Sha256::digest(data).to_vec(),
            SigningHash::Sha1 => Sha1::digest(data).to_vec(),
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SymmetricKeys {
    aes: [u8; 32],
    hmac: [u8; 32],
}

/// Negotiated symmetric session state.
///
/// One instance is shared by a connection's send and receive paths
/// behind a mutex; IV generation and cipher construction are atomic
/// with respect to each other under that lock.
pub struct SessionCrypto {
    keys: SymmetricKeys,
    signing_hash: SigningHash,
    rng: StdRng,
}

impl SessionCrypto {
    /// Installs a 256-bit AES key. The HMAC key is derived as
    /// `SHA-256(aes_key)` so both peers arrive at the same value
    /// without exchanging it.
    pub fn new(aes_key: [u8; 32], signing_hash: SigningHash, rng: StdRng) -> Self {
        let hmac: [u8; 32] = Sha256::digest(aes_key).into();
        SessionCrypto {
            keys: SymmetricKeys { aes: aes_key, hmac },
            signing_hash,
            rng,
        }
    }

    /// Generates a fresh session key.
    pub fn generate(signing_hash: SigningHash, mut rng: StdRng) -> Self {
        let mut aes = [0u8; 32];
        rng.fill_bytes(&mut aes);
        Self::new(aes, signing_hash, rng)
    }

    pub fn signing_hash(&self) -> SigningHash {
        self.signing_hash
    }

    pub fn aes_key(&self) -> &[u8; 32] {
        &self.keys.aes
    }

    pub fn generate_iv(&mut self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        self.rng.fill_bytes(&mut iv);
        iv
    }

    /// Encrypts under a fresh IV, PKCS#7 padded to the block size.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> ([u8; 16], Vec<u8>) {
        let iv = self.generate_iv();
        let cipher = Aes256CbcEnc::new(&self.keys.aes.into(), &iv.into());
        (iv, cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    pub fn decrypt(&self, iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcDec::new(&self.keys.aes.into(), iv.into());
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::DecryptionFailed)
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(&self.keys.hmac).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let expected = self.sign(data);
        if expected[..].ct_eq(signature).into() {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed)
        }
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto")
            .field("signing_hash", &self.signing_hash)
            .finish_non_exhaustive()
    }
}

/// An asymmetric identity key as the handshake consumes it: signing,
/// verification and key wrap, with an opaque public representation.
pub trait AuthKey: Send + Sync {
    /// Wire type name written alongside the public key bytes.
    fn key_type(&self) -> &str;

    /// Public half, DER encoded.
    fn public_bytes(&self) -> Result<Vec<u8>>;

    fn sign(&self, hash: SigningHash, data: &[u8]) -> Result<Vec<u8>>;

    fn verify(&self, hash: SigningHash, data: &[u8], signature: &[u8]) -> Result<()>;

    /// Wraps a symmetric key for the holder of the private half.
    fn encrypt(&self, rng: &mut StdRng, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// RSA implementation of [`AuthKey`]: OAEP key wrap, PKCS#1 v1.5
/// signatures under the negotiated hash.
pub struct RsaAuthKey {
    private: Option<RsaPrivateKey>,
    public: RsaPublicKey,
}

impl RsaAuthKey {
    pub const WIRE_NAME: &'static str = "RSA";
    pub const DEFAULT_BITS: usize = 2048;

    pub fn generate(rng: &mut StdRng) -> Result<Self> {
        Self::generate_with_bits(rng, Self::DEFAULT_BITS)
    }

    pub fn generate_with_bits(rng: &mut StdRng, bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(rng, bits).map_err(|e| Error::Key(e.to_string()))?;
        let public = private.to_public_key();
        Ok(RsaAuthKey {
            private: Some(private),
            public,
        })
    }

    /// Imports a peer's public key from its DER bytes.
    pub fn from_public_der(der: &[u8]) -> Result<Self> {
        let public =
            RsaPublicKey::from_public_key_der(der).map_err(|e| Error::Key(e.to_string()))?;
        Ok(RsaAuthKey {
            private: None,
            public,
        })
    }

    fn private(&self) -> Result<&RsaPrivateKey> {
        self.private
            .as_ref()
            .ok_or_else(|| Error::Key("operation requires the private key".into()))
    }

    fn padding(hash: SigningHash) -> Pkcs1v15Sign {
        match hash {
            SigningHash::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            SigningHash::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
        }
    }
}

impl AuthKey for RsaAuthKey {
    fn key_type(&self) -> &str {
        Self::WIRE_NAME
    }

    fn public_bytes(&self) -> Result<Vec<u8>> {
        Ok(self
            .public
            .to_public_key_der()
            .map_err(|e| Error::Key(e.to_string()))?
            .into_vec())
    }

    fn sign(&self, hash: SigningHash, data: &[u8]) -> Result<Vec<u8>> {
        let digest = hash.digest(data);
        self.private()?
            .sign(Self::padding(hash), &digest)
            .map_err(|e| Error::Key(e.to_string()))
    }

    fn verify(&self, hash: SigningHash, data: &[u8], signature: &[u8]) -> Result<()> {
        let digest = hash.digest(data);
        self.public
            .verify(Self::padding(hash), &digest, signature)
            .map_err(|_| Error::AuthenticationFailed)
    }

    fn encrypt(&self, rng: &mut StdRng, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.public
            .encrypt(rng, Oaep::new::<Sha1>(), plaintext)
            .map_err(|e| Error::Key(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private()?
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|_| Error::DecryptionFailed)
    }
}

impl std::fmt::Debug for RsaAuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaAuthKey")
            .field("has_private", &self.private.is_some())
            .finish_non_exhaustive()
    }
}
