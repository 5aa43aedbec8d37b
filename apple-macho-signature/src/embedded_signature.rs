// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common embedded signature data structures (blobs, magic values, slots).
//!
//! Code signing data embedded in a Mach-O binary is a tree of *blobs*. Every
//! blob begins with an 8 byte header: a u32 magic identifying the kind of
//! payload and a u32 length covering the header plus the payload. Blobs are
//! collected into a *superblob*, which carries an index of `(slot, offset)`
//! pairs pointing at each blob (see [crate::superblob]).
//!
//! All integers in code signing data are big-endian, regardless of the
//! endianness of the Mach-O binary they are embedded in. [SIGNING_ORDER]
//! names that byte order.
//!
//! The best source of the data structure definitions is Apple's open source
//! `cs_blobs.h` header in xnu.

use {
    crate::error::MachOSignatureError,
    digest::DynDigest,
    scroll::{IOwrite, Pread},
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        io::Write,
        str::FromStr,
    },
};

/// Byte order of all code signing data structures.
pub const SIGNING_ORDER: scroll::Endian = scroll::BE;

/// Size of a blob header (magic + length).
pub const BLOB_HEADER_SIZE: usize = 8;

/// Size of a serialized [BlobIndex] (slot type + offset).
pub const BLOB_INDEX_SIZE: usize = 8;

/// Maximum number of alternate code directories in a superblob.
pub const MAX_ALTERNATE_CODE_DIRECTORIES: usize = 5;

/// Defines header magic for various payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Code requirements blob.
    RequirementSet,
    /// CodeDirectory blob.
    CodeDirectory,
    /// Embedded signature.
    ///
    /// This is the magic of the superblob.
    EmbeddedSignature,
    /// Old embedded signature.
    EmbeddedSignatureOld,
    /// Entitlements blob.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// Multi-arch collection of embedded signatures.
    DetachedSignature,
    /// Generic blob wrapper.
    ///
    /// The CMS signature is stored in this type.
    BlobWrapper,
    /// Unknown magic.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade0b02 => Self::EmbeddedSignatureOld,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::EmbeddedSignatureOld => 0xfade0b02,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within code signing data.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    Signature,
    Identification,
    Ticket,
    Unknown(u32),
}

impl std::fmt::Debug for CodeSigningSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CodeDirectory => "CodeDirectory",
            Self::Info => "Info",
            Self::RequirementSet => "RequirementSet",
            Self::ResourceDir => "Resources",
            Self::Application => "Application",
            Self::Entitlements => "Entitlements",
            Self::RepSpecific => "Rep Specific",
            Self::EntitlementsDer => "DER Entitlements",
            Self::AlternateCodeDirectory0 => "CodeDirectory Alternate #0",
            Self::AlternateCodeDirectory1 => "CodeDirectory Alternate #1",
            Self::AlternateCodeDirectory2 => "CodeDirectory Alternate #2",
            Self::AlternateCodeDirectory3 => "CodeDirectory Alternate #3",
            Self::AlternateCodeDirectory4 => "CodeDirectory Alternate #4",
            Self::Signature => "CMS Signature",
            Self::Identification => "Identification",
            Self::Ticket => "Ticket",
            Self::Unknown(_) => "Unknown",
        };

        f.write_fmt(format_args!("{} ({})", name, u32::from(*self)))
    }
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            0x10001 => Self::Identification,
            0x10002 => Self::Ticket,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Identification => 0x10001,
            CodeSigningSlot::Ticket => 0x10002,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// Obtain the slot holding the `n`th alternate code directory.
    ///
    /// Only 5 alternate code directories exist. Requesting a 6th is an error.
    pub fn alternate_code_directory(n: usize) -> Result<Self, MachOSignatureError> {
        match n {
            0 => Ok(Self::AlternateCodeDirectory0),
            1 => Ok(Self::AlternateCodeDirectory1),
            2 => Ok(Self::AlternateCodeDirectory2),
            3 => Ok(Self::AlternateCodeDirectory3),
            4 => Ok(Self::AlternateCodeDirectory4),
            _ => Err(MachOSignatureError::AlternateCodeDirectoryLimit(n)),
        }
    }

    /// Whether this slot holds a code directory, primary or alternate.
    pub fn is_code_directory(&self) -> bool {
        matches!(self, Self::CodeDirectory) || self.is_alternate_code_directory()
    }

    /// Whether this slot is one of the alternate code directory slots.
    pub fn is_alternate_code_directory(&self) -> bool {
        matches!(
            self,
            Self::AlternateCodeDirectory0
                | Self::AlternateCodeDirectory1
                | Self::AlternateCodeDirectory2
                | Self::AlternateCodeDirectory3
                | Self::AlternateCodeDirectory4
        )
    }

    /// Whether this slot's digest can be recorded in code directory special slots.
    pub fn is_code_directory_specials_expressible(&self) -> bool {
        *self >= Self::Info && *self <= Self::EntitlementsDer
    }
}

/// An entry in a superblob's index.
///
/// `offset` is relative to the start of the superblob header, not the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobIndex {
    pub slot: CodeSigningSlot,
    pub offset: u32,
}

impl BlobIndex {
    /// Read an index entry from the start of a slice.
    pub fn parse(data: &[u8]) -> Result<Self, MachOSignatureError> {
        let slot = data.pread_with::<u32>(0, SIGNING_ORDER)?;
        let offset = data.pread_with::<u32>(4, SIGNING_ORDER)?;

        Ok(Self {
            slot: CodeSigningSlot::from(slot),
            offset,
        })
    }

    /// Write this entry to a writer in signing order.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), MachOSignatureError> {
        writer.iowrite_with(u32::from(self.slot), SIGNING_ORDER)?;
        writer.iowrite_with(self.offset, SIGNING_ORDER)?;

        Ok(())
    }
}

/// Represents a digest type encountered in code signature data structures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestType::None => f.write_str("none"),
            DigestType::Sha1 => f.write_str("sha1"),
            DigestType::Sha256 => f.write_str("sha256"),
            DigestType::Sha256Truncated => f.write_str("sha256-truncated"),
            DigestType::Sha384 => f.write_str("sha384"),
            DigestType::Sha512 => f.write_str("sha512"),
            DigestType::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl FromStr for DigestType {
    type Err = MachOSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha256-truncated" => Ok(Self::Sha256Truncated),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(MachOSignatureError::DigestUnknownAlgorithm),
        }
    }
}

impl DigestType {
    /// Obtain the size of hashes for this hash type.
    pub fn hash_len(&self) -> Result<usize, MachOSignatureError> {
        Ok(self.digest_data(&[])?.len())
    }

    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, MachOSignatureError> {
        match self {
            Self::None => Err(MachOSignatureError::DigestUnknownAlgorithm),
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::Unknown(_) => Err(MachOSignatureError::DigestUnknownAlgorithm),
        }
    }

    /// Obtain a resettable hasher for page hashing.
    ///
    /// The hasher produces full length digests. Callers digesting with
    /// [DigestType::Sha256Truncated] must pass results through
    /// [DigestType::truncate].
    pub fn new_resettable_hasher(&self) -> Result<Box<dyn DynDigest>, MachOSignatureError> {
        match self {
            Self::Sha1 => Ok(Box::new(sha1::Sha1::default())),
            Self::Sha256 | Self::Sha256Truncated => Ok(Box::new(sha2::Sha256::default())),
            Self::Sha384 => Ok(Box::new(sha2::Sha384::default())),
            Self::Sha512 => Ok(Box::new(sha2::Sha512::default())),
            Self::None | Self::Unknown(_) => Err(MachOSignatureError::DigestUnknownAlgorithm),
        }
    }

    /// Truncate a full length digest to the length recorded for this type.
    pub fn truncate(&self, mut digest: Vec<u8>) -> Vec<u8> {
        if matches!(self, Self::Sha256Truncated) {
            digest.truncate(20);
        }

        digest
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, MachOSignatureError> {
        let mut hasher = self.as_hasher()?;

        hasher.update(data);

        Ok(self.truncate(hasher.finish().as_ref().to_vec()))
    }
}

/// The 8 byte header at the start of every blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobHeader {
    pub magic: CodeSigningMagic,
    /// Total length of the blob, including this header.
    pub length: u32,
}

impl BlobHeader {
    /// Read a blob header from the start of a slice.
    ///
    /// Blobs begin with a u32 magic and u32 length, inclusive.
    pub fn parse(data: &[u8]) -> Result<Self, MachOSignatureError> {
        let magic = data.pread_with::<u32>(0, SIGNING_ORDER)?;
        let length = data.pread_with::<u32>(4, SIGNING_ORDER)?;

        Ok(Self {
            magic: CodeSigningMagic::from(magic),
            length,
        })
    }

    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), MachOSignatureError> {
        writer.iowrite_with(u32::from(self.magic), SIGNING_ORDER)?;
        writer.iowrite_with(self.length, SIGNING_ORDER)?;

        Ok(())
    }
}

/// A single tagged, length-prefixed unit of code signing data.
///
/// The header length is derived from the payload when the blob is
/// constructed and cannot be changed independently of it.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    header: BlobHeader,
    payload: Vec<u8>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("magic", &self.header.magic)
            .field("length", &self.header.length)
            .finish()
    }
}

impl Blob {
    /// Construct a blob from its magic and payload.
    pub fn new(magic: CodeSigningMagic, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();

        Self {
            header: BlobHeader {
                magic,
                length: (payload.len() + BLOB_HEADER_SIZE) as u32,
            },
            payload,
        }
    }

    /// Construct a generic blob wrapper, which is how CMS signatures are stored.
    pub fn blob_wrapper(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(CodeSigningMagic::BlobWrapper, payload)
    }

    /// Construct an entitlements blob from a plist XML document.
    pub fn entitlements(xml: &str) -> Self {
        Self::new(CodeSigningMagic::Entitlements, xml.as_bytes())
    }

    /// Construct a DER entitlements blob from already encoded DER.
    pub fn entitlements_der(der: impl Into<Vec<u8>>) -> Self {
        Self::new(CodeSigningMagic::EntitlementsDer, der)
    }

    /// Parse a blob from the start of a slice.
    ///
    /// Bytes after the length declared in the header are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, MachOSignatureError> {
        let header = BlobHeader::parse(data)?;
        let length = header.length as usize;

        if length < BLOB_HEADER_SIZE {
            return Err(MachOSignatureError::SuperblobMalformed);
        }

        let payload = data
            .get(BLOB_HEADER_SIZE..length)
            .ok_or(MachOSignatureError::SuperblobMalformed)?;

        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    /// Parse a blob, requiring a specific magic.
    pub fn parse_with_magic(
        data: &[u8],
        expected: CodeSigningMagic,
        what: &'static str,
    ) -> Result<Self, MachOSignatureError> {
        let blob = Self::parse(data)?;

        if blob.magic() != expected {
            Err(MachOSignatureError::BadMagic(what))
        } else {
            Ok(blob)
        }
    }

    pub fn header(&self) -> &BlobHeader {
        &self.header
    }

    pub fn magic(&self) -> CodeSigningMagic {
        self.header.magic
    }

    /// Total encoded length, header included.
    pub fn length(&self) -> u32 {
        self.header.length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Write the header and payload to a writer.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), MachOSignatureError> {
        self.header.write_to(writer)?;
        writer.write_all(&self.payload)?;

        Ok(())
    }

    /// Serialize the blob, header included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MachOSignatureError> {
        let mut res = Vec::with_capacity(self.header.length as usize);
        self.write_to(&mut res)?;

        Ok(res)
    }

    /// Compute the digest of the serialized blob.
    pub fn digest_with(&self, hash_type: DigestType) -> Result<Vec<u8>, MachOSignatureError> {
        hash_type.digest_data(&self.to_bytes()?)
    }
}
