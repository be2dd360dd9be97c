// title/ticket.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for 3DS Ticket parsing and editing.

use std::io::{Cursor, Read, Write};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::title::cert::{verify_signature, CertificateChain, CertificateError, SignatureType};
use crate::title::crypto::{decrypt_title_key, encrypt_title_key, TitleCryptoError};

pub const TICKET_SIG_TYPE: u32 = 0x00010004;
pub const TICKET_ISSUER: &str = "Root-CA00000003-XS0000000c";
pub const TICKET_ISSUER_DEV: &str = "Root-CA00000004-XS00000009";
pub const TICKET_CONTENT_INDEX_OFFSET: usize = 0x2A4;
pub const TICKET_MIN_SIZE: usize = 0x2B4;
pub const TICKET_COMMON_SIZE: usize = 0x350;
pub const TICKET_MAX_SIZE: usize = 0x10000;
const TICKET_SIGNED_START: usize = 0x140;

// Content index block used by tickets that grant access to every content.
const FAKE_CONTENT_INDEX: [u8; 0x30] = [
    0x00, 0x01, 0x00, 0x14, 0x00, 0x00, 0x00, 0xAC, 0x00, 0x00, 0x00, 0x14, 0x00, 0x01, 0x00, 0x14,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x84,
    0x00, 0x00, 0x00, 0x84, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Ticket has unsupported signature type `{0:#010X}`")]
    BadSignatureType(u32),
    #[error("Ticket was issued by unknown signer `{0}`")]
    UnknownIssuer(String),
    #[error("Ticket has an invalid size of {0:#X} bytes")]
    InvalidSize(usize),
    #[error("signature issuer string must not exceed 64 characters (was {0})")]
    IssuerTooLong(usize),
    #[error("Title Key could not be processed")]
    TitleKey(#[from] TitleCryptoError),
    #[error("Ticket signature could not be checked")]
    Certificate(#[from] CertificateError),
    #[error("Ticket data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// A structure that represents a 3DS Ticket file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub signature_type: u32,
    pub signature: [u8; 256],
    padding1: [u8; 60],
    pub signature_issuer: [u8; 64],
    pub ecdh_data: [u8; 60],
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    pub title_key: [u8; 16],
    reserved1: u8,
    pub ticket_id: u64,
    pub console_id: u32,
    pub title_id: u64,
    pub sys_access: [u8; 2],
    pub ticket_version: u16,
    pub time_mask: [u8; 4],
    pub permit_mask: [u8; 4],
    pub title_export: u8,
    pub common_key_index: u8,
    reserved2: [u8; 0x2A],
    pub eshop_id: u32,
    reserved3: u8,
    pub audit: u8,
    pub content_permissions: [u8; 0x40],
    reserved4: [u8; 2],
    pub time_limits: [u8; 0x40],
    pub content_index: Vec<u8>,
}

impl Ticket {
    /// Creates a new Ticket instance from the binary data of a Ticket file. Anything past the end
    /// of the content index is ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TicketError> {
        if data.len() < TICKET_MIN_SIZE {
            return Err(TicketError::InvalidSize(data.len()));
        }
        let mut buf = Cursor::new(data);
        let signature_type = buf.read_u32::<BigEndian>()?;
        if signature_type != TICKET_SIG_TYPE {
            return Err(TicketError::BadSignatureType(signature_type));
        }
        let mut signature = [0u8; 256];
        buf.read_exact(&mut signature)?;
        let mut padding1 = [0u8; 60];
        buf.read_exact(&mut padding1)?;
        let mut signature_issuer = [0u8; 64];
        buf.read_exact(&mut signature_issuer)?;
        let mut ecdh_data = [0u8; 60];
        buf.read_exact(&mut ecdh_data)?;
        let version = buf.read_u8()?;
        let ca_crl_version = buf.read_u8()?;
        let signer_crl_version = buf.read_u8()?;
        let mut title_key = [0u8; 16];
        buf.read_exact(&mut title_key)?;
        let reserved1 = buf.read_u8()?;
        let ticket_id = buf.read_u64::<BigEndian>()?;
        let console_id = buf.read_u32::<BigEndian>()?;
        let title_id = buf.read_u64::<BigEndian>()?;
        let mut sys_access = [0u8; 2];
        buf.read_exact(&mut sys_access)?;
        let ticket_version = buf.read_u16::<BigEndian>()?;
        let mut time_mask = [0u8; 4];
        buf.read_exact(&mut time_mask)?;
        let mut permit_mask = [0u8; 4];
        buf.read_exact(&mut permit_mask)?;
        let title_export = buf.read_u8()?;
        let common_key_index = buf.read_u8()?;
        let mut reserved2 = [0u8; 0x2A];
        buf.read_exact(&mut reserved2)?;
        let eshop_id = buf.read_u32::<BigEndian>()?;
        let reserved3 = buf.read_u8()?;
        let audit = buf.read_u8()?;
        let mut content_permissions = [0u8; 0x40];
        buf.read_exact(&mut content_permissions)?;
        let mut reserved4 = [0u8; 2];
        buf.read_exact(&mut reserved4)?;
        let mut time_limits = [0u8; 0x40];
        buf.read_exact(&mut time_limits)?;
        // The content index carries its own size, which decides the size of the whole ticket.
        let size = ticket_size(data)?;
        if data.len() < size {
            return Err(TicketError::InvalidSize(size));
        }
        let content_index = data[TICKET_CONTENT_INDEX_OFFSET..size].to_vec();
        Ok(Ticket {
            signature_type,
            signature,
            padding1,
            signature_issuer,
            ecdh_data,
            version,
            ca_crl_version,
            signer_crl_version,
            title_key,
            reserved1,
            ticket_id,
            console_id,
            title_id,
            sys_access,
            ticket_version,
            time_mask,
            permit_mask,
            title_export,
            common_key_index,
            reserved2,
            eshop_id,
            reserved3,
            audit,
            content_permissions,
            reserved4,
            time_limits,
            content_index,
        })
    }

    /// Dumps the data in a Ticket back into binary data that can be written to a file.
    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.size());
        buf.write_u32::<BigEndian>(self.signature_type)?;
        buf.write_all(&self.signature)?;
        buf.write_all(&self.padding1)?;
        buf.write_all(&self.signature_issuer)?;
        buf.write_all(&self.ecdh_data)?;
        buf.write_u8(self.version)?;
        buf.write_u8(self.ca_crl_version)?;
        buf.write_u8(self.signer_crl_version)?;
        buf.write_all(&self.title_key)?;
        buf.write_u8(self.reserved1)?;
        buf.write_u64::<BigEndian>(self.ticket_id)?;
        buf.write_u32::<BigEndian>(self.console_id)?;
        buf.write_u64::<BigEndian>(self.title_id)?;
        buf.write_all(&self.sys_access)?;
        buf.write_u16::<BigEndian>(self.ticket_version)?;
        buf.write_all(&self.time_mask)?;
        buf.write_all(&self.permit_mask)?;
        buf.write_u8(self.title_export)?;
        buf.write_u8(self.common_key_index)?;
        buf.write_all(&self.reserved2)?;
        buf.write_u32::<BigEndian>(self.eshop_id)?;
        buf.write_u8(self.reserved3)?;
        buf.write_u8(self.audit)?;
        buf.write_all(&self.content_permissions)?;
        buf.write_all(&self.reserved4)?;
        buf.write_all(&self.time_limits)?;
        buf.write_all(&self.content_index)?;
        Ok(buf)
    }

    /// Builds an unsigned ticket for the given title that grants access to all of its contents.
    /// The Title Key is left as all 0xFF, and should be set with `set_title_key_dec()`.
    pub fn new_fake(title_id: u64, is_dev: bool) -> Self {
        let issuer = if is_dev { TICKET_ISSUER_DEV } else { TICKET_ISSUER };
        let mut signature_issuer = [0u8; 64];
        signature_issuer[..issuer.len()].copy_from_slice(issuer.as_bytes());
        let mut content_index = vec![0xFFu8; TICKET_COMMON_SIZE - TICKET_CONTENT_INDEX_OFFSET];
        content_index[..FAKE_CONTENT_INDEX.len()].copy_from_slice(&FAKE_CONTENT_INDEX);
        Ticket {
            signature_type: TICKET_SIG_TYPE,
            signature: [0xFF; 256],
            padding1: [0; 60],
            signature_issuer,
            ecdh_data: [0xFF; 60],
            version: 1,
            ca_crl_version: 0,
            signer_crl_version: 0,
            title_key: [0xFF; 16],
            reserved1: 0,
            ticket_id: 0,
            console_id: 0,
            title_id,
            sys_access: [0; 2],
            ticket_version: 0,
            time_mask: [0; 4],
            permit_mask: [0; 4],
            title_export: 0,
            common_key_index: 0, // eShop
            reserved2: [0; 0x2A],
            eshop_id: 0,
            reserved3: 0,
            audit: 1,
            content_permissions: [0; 0x40],
            reserved4: [0; 2],
            time_limits: [0; 0x40],
            content_index,
        }
    }

    /// Gets the size of the Ticket in bytes.
    pub fn size(&self) -> usize {
        TICKET_CONTENT_INDEX_OFFSET + self.content_index.len()
    }

    /// Gets the name of the certificate used to sign a Ticket as a string.
    pub fn signature_issuer(&self) -> String {
        String::from_utf8_lossy(&self.signature_issuer).trim_end_matches('\0').to_owned()
    }

    /// Sets a new name for the certificate used to sign a Ticket.
    pub fn set_signature_issuer(&mut self, signature_issuer: &str) -> Result<(), TicketError> {
        if signature_issuer.len() > 64 {
            return Err(TicketError::IssuerTooLong(signature_issuer.len()));
        }
        self.signature_issuer = [0; 64];
        self.signature_issuer[..signature_issuer.len()].copy_from_slice(signature_issuer.as_bytes());
        Ok(())
    }

    /// Gets whether a Ticket was signed for development (true) or retail (false).
    pub fn is_dev(&self) -> bool {
        self.signature_issuer() == TICKET_ISSUER_DEV
    }

    /// Checks that the Ticket has a known signature type and issuer.
    pub fn validate(&self) -> Result<(), TicketError> {
        if self.signature_type != TICKET_SIG_TYPE {
            return Err(TicketError::BadSignatureType(self.signature_type));
        }
        let issuer = self.signature_issuer();
        if issuer != TICKET_ISSUER && issuer != TICKET_ISSUER_DEV {
            return Err(TicketError::UnknownIssuer(issuer));
        }
        if !(TICKET_MIN_SIZE..=TICKET_MAX_SIZE).contains(&self.size()) {
            return Err(TicketError::InvalidSize(self.size()));
        }
        Ok(())
    }

    /// Gets the decrypted version of the Title Key stored in a Ticket.
    pub fn title_key_dec(&self, ctx: &mut CryptoContext) -> Result<[u8; 16], TicketError> {
        Ok(decrypt_title_key(ctx, self.title_key, self.common_key_index, self.title_id, self.is_dev())?)
    }

    /// Encrypts and stores a new Title Key.
    pub fn set_title_key_dec(&mut self, ctx: &mut CryptoContext, title_key: [u8; 16]) -> Result<(), TicketError> {
        self.title_key = encrypt_title_key(ctx, title_key, self.common_key_index, self.title_id, self.is_dev())?;
        Ok(())
    }

    /// Gets the part of the Ticket covered by its signature.
    pub fn signed_data(&self) -> Result<Vec<u8>, std::io::Error> {
        Ok(self.to_bytes()?.split_off(TICKET_SIGNED_START))
    }

    /// Verifies the RSA signature of the Ticket using the matching certificate from the chain.
    pub fn verify_signature(&self, chain: &CertificateChain) -> Result<bool, TicketError> {
        let signer = chain.find_signer(&self.signature_issuer())?;
        Ok(verify_signature(signer, SignatureType::Rsa2048Sha256, &self.signature, &self.signed_data()?)?)
    }
}

/// Gets the full size of a Ticket from its content index header, without parsing the rest of it.
pub fn ticket_size(data: &[u8]) -> Result<usize, TicketError> {
    if data.len() < TICKET_MIN_SIZE {
        return Err(TicketError::InvalidSize(data.len()));
    }
    let mut buf = Cursor::new(&data[TICKET_CONTENT_INDEX_OFFSET + 4..]);
    let index_size = buf.read_u32::<BigEndian>()? as usize;
    let size = TICKET_CONTENT_INDEX_OFFSET + index_size;
    if !(TICKET_MIN_SIZE..=TICKET_MAX_SIZE).contains(&size) {
        return Err(TicketError::InvalidSize(size));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::cert::test_keys::{sign_sha256, test_chain};

    const TITLE_ID: u64 = 0x0004000000055D00;

    #[test]
    fn test_fake_ticket_layout() {
        let ticket = Ticket::new_fake(TITLE_ID, false);
        let data = ticket.to_bytes().unwrap();
        assert_eq!(data.len(), TICKET_COMMON_SIZE);
        assert_eq!(&data[0x140..0x140 + TICKET_ISSUER.len()], TICKET_ISSUER.as_bytes());
        assert_eq!(data[0x1BC], 1);
        assert_eq!(&data[0x1BF..0x1CF], &[0xFF; 16]);
        assert_eq!(&data[0x1DC..0x1E4], &TITLE_ID.to_be_bytes());
        assert_eq!(data[0x1F1], 0);
        assert_eq!(data[0x221], 1);
        assert_eq!(&data[0x2A4..0x2AC], &[0x00, 0x01, 0x00, 0x14, 0x00, 0x00, 0x00, 0xAC]);
        assert_eq!(ticket_size(&data).unwrap(), TICKET_COMMON_SIZE);
        let parsed = Ticket::from_bytes(&data).unwrap();
        assert_eq!(parsed, ticket);
        parsed.validate().unwrap();
        assert!(Ticket::new_fake(TITLE_ID, true).is_dev());
    }

    #[test]
    fn test_title_key() {
        let mut ctx = CryptoContext::new();
        let mut ticket = Ticket::new_fake(TITLE_ID, false);
        ticket.set_title_key_dec(&mut ctx, [0u8; 16]).unwrap();
        assert_eq!(ticket.title_key, [0xcf, 0x9c, 0xf1, 0xd3, 0x38, 0x63, 0xf4, 0xd2, 0x5c, 0x03, 0x7b, 0xda, 0x9f, 0x97, 0x44, 0xab]);
        assert_eq!(ticket.title_key_dec(&mut ctx).unwrap(), [0u8; 16]);
        ticket.common_key_index = 7;
        assert!(matches!(ticket.title_key_dec(&mut ctx), Err(TicketError::TitleKey(_))));
    }

    #[test]
    fn test_trailing_data_ignored() {
        let mut data = Ticket::new_fake(TITLE_ID, false).to_bytes().unwrap();
        data.extend_from_slice(&[0u8; 0x40]);
        assert_eq!(Ticket::from_bytes(&data).unwrap().size(), TICKET_COMMON_SIZE);
    }

    #[test]
    fn test_invalid_tickets() {
        let data = Ticket::new_fake(TITLE_ID, false).to_bytes().unwrap();
        assert!(matches!(Ticket::from_bytes(&data[..0x200]), Err(TicketError::InvalidSize(0x200))));
        let mut bad_size = data.clone();
        bad_size[0x2A8..0x2AC].copy_from_slice(&0x200u32.to_be_bytes());
        assert!(matches!(Ticket::from_bytes(&bad_size), Err(TicketError::InvalidSize(0x4A4))));
        let mut bad_sig = data.clone();
        bad_sig[3] = 0x05;
        assert!(matches!(Ticket::from_bytes(&bad_sig), Err(TicketError::BadSignatureType(0x00010005))));
        let mut ticket = Ticket::from_bytes(&data).unwrap();
        ticket.set_signature_issuer("Root-CA00000003-CP0000000b").unwrap();
        assert!(matches!(ticket.validate(), Err(TicketError::UnknownIssuer(_))));
    }

    #[test]
    fn test_verify_signature() {
        let chain = test_chain();
        let mut ticket = Ticket::new_fake(TITLE_ID, false);
        let sig = sign_sha256(&ticket.signed_data().unwrap());
        ticket.signature.copy_from_slice(&sig);
        assert!(ticket.verify_signature(&chain).unwrap());
        ticket.title_key[0] ^= 1;
        assert!(!ticket.verify_signature(&chain).unwrap());
    }
}
