// title/cert.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for validating the signatures of 3DS titles.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::{BigUint, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("data appears to be signed with invalid signature type `{0:#010X}`")]
    InvalidSignatureType(u32),
    #[error("certificate appears to contain key with invalid type `{0}`")]
    InvalidContainedKeyType(u32),
    #[error("certificate chain is missing required certificate `{0}`")]
    MissingCertificate(String),
    #[error("attempted to load incorrect certificate `{0}`")]
    IncorrectCertificate(String),
    #[error("the data you are attempting to verify was not signed with the provided certificate")]
    NonMatchingCertificates,
    #[error("certificate `{0}` does not hold a usable RSA public key")]
    InvalidPublicKey(String),
    #[error("ECC signatures cannot be verified")]
    UnsupportedSignature,
    #[error("certificate data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// The signature schemes used by signed 3DS data. Only the SHA-256 variants appear in 3DS titles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Rsa4096Sha1,
    Rsa2048Sha1,
    EccSha1,
    Rsa4096Sha256,
    Rsa2048Sha256,
    EccSha256,
}

impl SignatureType {
    pub fn from_u32(value: u32) -> Result<Self, CertificateError> {
        match value {
            0x00010000 => Ok(SignatureType::Rsa4096Sha1),
            0x00010001 => Ok(SignatureType::Rsa2048Sha1),
            0x00010002 => Ok(SignatureType::EccSha1),
            0x00010003 => Ok(SignatureType::Rsa4096Sha256),
            0x00010004 => Ok(SignatureType::Rsa2048Sha256),
            0x00010005 => Ok(SignatureType::EccSha256),
            _ => Err(CertificateError::InvalidSignatureType(value)),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            SignatureType::Rsa4096Sha1 => 0x00010000,
            SignatureType::Rsa2048Sha1 => 0x00010001,
            SignatureType::EccSha1 => 0x00010002,
            SignatureType::Rsa4096Sha256 => 0x00010003,
            SignatureType::Rsa2048Sha256 => 0x00010004,
            SignatureType::EccSha256 => 0x00010005,
        }
    }

    /// Gets the length of the signature itself.
    pub fn signature_len(&self) -> usize {
        match self {
            SignatureType::Rsa4096Sha1 | SignatureType::Rsa4096Sha256 => 0x200,
            SignatureType::Rsa2048Sha1 | SignatureType::Rsa2048Sha256 => 0x100,
            SignatureType::EccSha1 | SignatureType::EccSha256 => 0x3C,
        }
    }

    /// Gets the offset of the signed data, which starts after the signature type, the signature and
    /// the padding that aligns it to 64 bytes.
    pub fn signed_offset(&self) -> usize {
        (4 + self.signature_len()).next_multiple_of(0x40)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKeyType {
    Rsa4096,
    Rsa2048,
    ECC,
}

impl CertificateKeyType {
    fn from_u32(value: u32) -> Result<Self, CertificateError> {
        match value {
            0 => Ok(CertificateKeyType::Rsa4096),
            1 => Ok(CertificateKeyType::Rsa2048),
            2 => Ok(CertificateKeyType::ECC),
            _ => Err(CertificateError::InvalidContainedKeyType(value)),
        }
    }

    fn as_u32(&self) -> u32 {
        match self {
            CertificateKeyType::Rsa4096 => 0,
            CertificateKeyType::Rsa2048 => 1,
            CertificateKeyType::ECC => 2,
        }
    }

    // Modulus (or ECC point) length, exponent length, and trailing padding.
    fn layout(&self) -> (usize, usize, usize) {
        match self {
            CertificateKeyType::Rsa4096 => (0x200, 4, 0x34),
            CertificateKeyType::Rsa2048 => (0x100, 4, 0x34),
            CertificateKeyType::ECC => (0x3C, 0, 0x3C),
        }
    }
}

/// A structure that represents the components of a 3DS signing certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    signer_key_type: SignatureType,
    signature: Vec<u8>,
    signature_issuer: [u8; 64],
    pub_key_type: CertificateKeyType,
    child_cert_identity: [u8; 64],
    pub_key_id: u32,
    pub_key_modulus: Vec<u8>,
    pub_key_exponent: u32,
}

fn name_bytes(name: &str) -> [u8; 64] {
    let mut out = [0u8; 64];
    let len = name.len().min(64);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

impl Certificate {
    /// Creates a new unsigned certificate holding an RSA-2048 public key.
    pub fn new_rsa2048(signer_key_type: SignatureType, issuer: &str, name: &str, modulus: &[u8], exponent: u32) -> Self {
        let mut pub_key_modulus = vec![0u8; 0x100];
        let start = 0x100 - modulus.len().min(0x100);
        pub_key_modulus[start..].copy_from_slice(&modulus[modulus.len() - (0x100 - start)..]);
        Certificate {
            signer_key_type,
            signature: vec![0u8; signer_key_type.signature_len()],
            signature_issuer: name_bytes(issuer),
            pub_key_type: CertificateKeyType::Rsa2048,
            child_cert_identity: name_bytes(name),
            pub_key_id: 0,
            pub_key_modulus,
            pub_key_exponent: exponent,
        }
    }

    /// Creates a new Certificate instance from the binary data of a certificate file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CertificateError> {
        let mut buf = Cursor::new(data);
        let signer_key_type = SignatureType::from_u32(buf.read_u32::<BigEndian>()?)?;
        let mut signature = vec![0u8; signer_key_type.signature_len()];
        buf.read_exact(&mut signature)?;
        buf.seek(SeekFrom::Start(signer_key_type.signed_offset() as u64))?;
        let mut signature_issuer = [0u8; 64];
        buf.read_exact(&mut signature_issuer)?;
        let pub_key_type = CertificateKeyType::from_u32(buf.read_u32::<BigEndian>()?)?;
        let mut child_cert_identity = [0u8; 64];
        buf.read_exact(&mut child_cert_identity)?;
        let pub_key_id = buf.read_u32::<BigEndian>()?;
        let (modulus_len, exponent_len, _) = pub_key_type.layout();
        let mut pub_key_modulus = vec![0u8; modulus_len];
        buf.read_exact(&mut pub_key_modulus)?;
        let pub_key_exponent = if exponent_len != 0 { buf.read_u32::<BigEndian>()? } else { 0 };
        Ok(Certificate {
            signer_key_type,
            signature,
            signature_issuer,
            pub_key_type,
            child_cert_identity,
            pub_key_id,
            pub_key_modulus,
            pub_key_exponent,
        })
    }

    /// Dumps the data in a Certificate instance back into binary data that can be written to a file.
    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.size());
        buf.write_u32::<BigEndian>(self.signer_key_type.as_u32())?;
        buf.write_all(&self.signature)?;
        buf.resize(self.signer_key_type.signed_offset(), 0);
        buf.write_all(&self.signature_issuer)?;
        buf.write_u32::<BigEndian>(self.pub_key_type.as_u32())?;
        buf.write_all(&self.child_cert_identity)?;
        buf.write_u32::<BigEndian>(self.pub_key_id)?;
        buf.write_all(&self.pub_key_modulus)?;
        if self.pub_key_type != CertificateKeyType::ECC {
            buf.write_u32::<BigEndian>(self.pub_key_exponent)?;
        }
        buf.resize(self.size(), 0);
        Ok(buf)
    }

    /// Gets the size of the certificate in bytes.
    pub fn size(&self) -> usize {
        let (modulus_len, exponent_len, padding) = self.pub_key_type.layout();
        self.signer_key_type.signed_offset() + 0x88 + modulus_len + exponent_len + padding
    }

    pub fn signature_issuer(&self) -> String {
        String::from_utf8_lossy(&self.signature_issuer).trim_end_matches('\0').to_owned()
    }

    pub fn child_cert_identity(&self) -> String {
        String::from_utf8_lossy(&self.child_cert_identity).trim_end_matches('\0').to_owned()
    }

    /// Gets the issuer string that data signed by this certificate carries, like
    /// `Root-CA00000003-XS0000000c`.
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.signature_issuer(), self.child_cert_identity())
    }

    pub fn pub_key_modulus(&self) -> &[u8] {
        &self.pub_key_modulus
    }

    pub fn pub_key_exponent(&self) -> u32 {
        self.pub_key_exponent
    }

    pub fn signer_key_type(&self) -> SignatureType {
        self.signer_key_type
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn set_signature(&mut self, signature: &[u8]) {
        self.signature = signature.to_vec();
    }

    fn public_key(&self) -> Result<RsaPublicKey, CertificateError> {
        if self.pub_key_type == CertificateKeyType::ECC {
            return Err(CertificateError::UnsupportedSignature);
        }
        RsaPublicKey::new(BigUint::from_bytes_be(&self.pub_key_modulus), BigUint::from(self.pub_key_exponent))
            .map_err(|_| CertificateError::InvalidPublicKey(self.full_name()))
    }
}

/// A certificate chain, as stored in a CIA (CA, then the ticket signer, then the TMD signer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certs: Vec<Certificate>,
}

impl CertificateChain {
    /// Creates a new CertificateChain from the binary data of a chain. Parsing stops at the end of
    /// the data or at the first block of zero padding.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CertificateError> {
        let mut certs: Vec<Certificate> = Vec::new();
        let mut offset = 0;
        while offset + 4 <= data.len() && data[offset..offset + 4] != [0u8; 4] {
            let cert = Certificate::from_bytes(&data[offset..])?;
            offset += cert.size();
            certs.push(cert);
        }
        if certs.is_empty() {
            return Err(CertificateError::MissingCertificate("CA".to_owned()));
        }
        Ok(CertificateChain { certs })
    }

    pub fn from_certs(certs: Vec<Certificate>) -> Self {
        CertificateChain { certs }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::new();
        for cert in &self.certs {
            buf.write_all(&cert.to_bytes()?)?;
        }
        Ok(buf)
    }

    pub fn certs(&self) -> &[Certificate] {
        &self.certs
    }

    /// Finds the certificate that signed data carrying the given issuer string.
    pub fn find_signer(&self, issuer: &str) -> Result<&Certificate, CertificateError> {
        self.certs.iter()
            .find(|cert| cert.full_name() == issuer)
            .ok_or_else(|| CertificateError::MissingCertificate(issuer.to_owned()))
    }
}

/// Verifies an RSA signature over `signed_data` using the public key of `signer`.
pub fn verify_signature(signer: &Certificate, sig_type: SignatureType, signature: &[u8], signed_data: &[u8]) -> Result<bool, CertificateError> {
    let key = signer.public_key()?;
    let result = match sig_type {
        SignatureType::Rsa2048Sha256 | SignatureType::Rsa4096Sha256 => {
            let hash = Sha256::digest(signed_data);
            key.verify(Pkcs1v15Sign::new::<Sha256>(), &hash, signature)
        },
        SignatureType::Rsa2048Sha1 | SignatureType::Rsa4096Sha1 => {
            let hash = Sha1::digest(signed_data);
            key.verify(Pkcs1v15Sign::new::<Sha1>(), &hash, signature)
        },
        SignatureType::EccSha1 | SignatureType::EccSha256 => return Err(CertificateError::UnsupportedSignature),
    };
    Ok(result.is_ok())
}

/// Verifies a certificate using the certificate that issued it. The two must match, or this
/// function will return an error without attempting signature verification.
pub fn verify_child_cert(parent: &Certificate, child: &Certificate) -> Result<bool, CertificateError> {
    if parent.full_name() != child.signature_issuer() {
        return Err(CertificateError::NonMatchingCertificates);
    }
    let body = child.to_bytes()?;
    verify_signature(parent, child.signer_key_type, &child.signature, &body[child.signer_key_type.signed_offset()..])
}

#[cfg(test)]
pub(crate) mod test_keys {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::traits::PublicKeyParts;

    pub fn test_private_key() -> RsaPrivateKey {
        RsaPrivateKey::from_pkcs8_pem(include_str!("keys/test-priv.pem")).unwrap()
    }

    pub fn sign_sha256(data: &[u8]) -> Vec<u8> {
        let hash = Sha256::digest(data);
        test_private_key().sign(Pkcs1v15Sign::new::<Sha256>(), &hash).unwrap()
    }

    /// Builds a signed CA certificate and a ticket signer certificate, both holding the test key.
    pub fn test_chain() -> CertificateChain {
        let key = test_private_key();
        let modulus = key.n().to_bytes_be();
        let exponent = key.e().to_bytes_be().iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
        let mut ca = Certificate::new_rsa2048(SignatureType::Rsa2048Sha256, "Root", "CA00000003", &modulus, exponent);
        let body = ca.to_bytes().unwrap();
        ca.set_signature(&sign_sha256(&body[0x140..]));
        let mut xs = Certificate::new_rsa2048(SignatureType::Rsa2048Sha256, "Root-CA00000003", "XS0000000c", &modulus, exponent);
        let body = xs.to_bytes().unwrap();
        xs.set_signature(&sign_sha256(&body[0x140..]));
        let mut cp = Certificate::new_rsa2048(SignatureType::Rsa2048Sha256, "Root-CA00000003", "CP0000000b", &modulus, exponent);
        let body = cp.to_bytes().unwrap();
        cp.set_signature(&sign_sha256(&body[0x140..]));
        CertificateChain::from_certs(vec![ca, xs, cp])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_keys::*;

    #[test]
    fn test_signature_type() {
        let sig_type = SignatureType::from_u32(0x00010004).unwrap();
        assert_eq!(sig_type, SignatureType::Rsa2048Sha256);
        assert_eq!(sig_type.signature_len(), 0x100);
        assert_eq!(sig_type.signed_offset(), 0x140);
        assert_eq!(SignatureType::Rsa4096Sha256.signed_offset(), 0x240);
        assert_eq!(SignatureType::EccSha256.signed_offset(), 0x40);
        assert!(matches!(SignatureType::from_u32(7), Err(CertificateError::InvalidSignatureType(7))));
    }

    #[test]
    fn test_cert_sizes() {
        let ca = Certificate::new_rsa2048(SignatureType::Rsa4096Sha256, "Root", "CA00000003", &[1; 0x100], 0x10001);
        assert_eq!(ca.size(), 0x400);
        assert_eq!(ca.to_bytes().unwrap().len(), 0x400);
        let xs = Certificate::new_rsa2048(SignatureType::Rsa2048Sha256, "Root-CA00000003", "XS0000000c", &[1; 0x100], 0x10001);
        assert_eq!(xs.size(), 0x300);
        assert_eq!(xs.full_name(), "Root-CA00000003-XS0000000c");
        assert_eq!(Certificate::from_bytes(&xs.to_bytes().unwrap()).unwrap(), xs);
    }

    #[test]
    fn test_chain_roundtrip() {
        let chain = test_chain();
        let mut data = chain.to_bytes().unwrap();
        assert_eq!(data.len(), 0x900);
        data.resize(0xA00, 0);
        let parsed = CertificateChain::from_bytes(&data).unwrap();
        assert_eq!(parsed, chain);
        assert_eq!(parsed.find_signer("Root-CA00000003-CP0000000b").unwrap().child_cert_identity(), "CP0000000b");
        assert!(matches!(parsed.find_signer("Root-CA00000004-XS00000009"), Err(CertificateError::MissingCertificate(_))));
    }

    #[test]
    fn test_verify_chain() {
        let chain = test_chain();
        let ca = &chain.certs()[0];
        let xs = &chain.certs()[1];
        assert!(verify_child_cert(ca, xs).unwrap());
        let mut tampered = xs.clone();
        tampered.pub_key_id = 1;
        assert!(!verify_child_cert(ca, &tampered).unwrap());
        assert!(matches!(verify_child_cert(xs, ca), Err(CertificateError::NonMatchingCertificates)));
    }

    #[test]
    fn test_verify_signature() {
        let chain = test_chain();
        let signer = chain.find_signer("Root-CA00000003-XS0000000c").unwrap();
        let signature = sign_sha256(b"signed data");
        assert!(verify_signature(signer, SignatureType::Rsa2048Sha256, &signature, b"signed data").unwrap());
        assert!(!verify_signature(signer, SignatureType::Rsa2048Sha256, &signature, b"other data").unwrap());
        assert!(matches!(verify_signature(signer, SignatureType::EccSha256, &signature, b""), Err(CertificateError::UnsupportedSignature)));
    }
}
