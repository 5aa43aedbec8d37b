// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and related types.
//!
//! The code directory header is a fixed 36 byte prefix followed by groups of
//! fields that were appended to the structure over time. Each group only
//! exists when the declared version is at least the version that introduced
//! it. [FieldGroup] enumerates these groups in wire order. Serialization and
//! parsing walk that list and stop at the first group newer than the
//! declared version.
//!
//! Offsets stored in the header (`hash_offset`, `ident_offset`,
//! `team_offset`) are relative to the start of the code directory blob,
//! i.e. they include the 8 byte blob header. This is what Apple's tooling
//! produces and verifies.

use {
    crate::{
        embedded_signature::{
            Blob, CodeSigningMagic, CodeSigningSlot, DigestType, BLOB_HEADER_SIZE, SIGNING_ORDER,
        },
        error::MachOSignatureError,
    },
    scroll::{IOwrite, Pread},
    std::{collections::BTreeMap, io::Write, str::FromStr},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature. They are independent of the code directory version.
    #[derive(Default)]
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

impl FromStr for CodeSignatureFlags {
    type Err = MachOSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::HOST),
            "adhoc" => Ok(Self::ADHOC),
            "hard" => Ok(Self::FORCE_HARD),
            "kill" => Ok(Self::FORCE_KILL),
            "expires" => Ok(Self::FORCE_EXPIRATION),
            "restrict" => Ok(Self::RESTRICT),
            "enforcement" => Ok(Self::ENFORCEMENT),
            "library" => Ok(Self::LIBRARY_VALIDATION),
            "runtime" => Ok(Self::RUNTIME),
            "linker-signed" => Ok(Self::LINKER_SIGNED),
            _ => Err(MachOSignatureError::CodeSignatureUnknownFlag(s.to_string())),
        }
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

impl FromStr for ExecutableSegmentFlags {
    type Err = MachOSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main-binary" => Ok(Self::MAIN_BINARY),
            "allow-unsigned" => Ok(Self::ALLOW_UNSIGNED),
            "debugger" => Ok(Self::DEBUGGER),
            "jit" => Ok(Self::JIT),
            "skip-library-validation" => Ok(Self::SKIP_LIBRARY_VALIDATION),
            "can-load-cd-hash" => Ok(Self::CAN_LOAD_CD_HASH),
            "can-exec-cd-hash" => Ok(Self::CAN_EXEC_CD_HASH),
            _ => Err(MachOSignatureError::ExecutableSegmentUnknownFlag(
                s.to_string(),
            )),
        }
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20001,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
}

impl From<CodeDirectoryVersion> for u32 {
    fn from(v: CodeDirectoryVersion) -> Self {
        v as u32
    }
}

/// Size of the header fields present in every code directory version.
pub const CODE_DIRECTORY_FIXED_SIZE: usize = 36;

/// A group of code directory header fields introduced by a specific version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldGroup {
    /// `scatterOffset`.
    Scatter,
    /// `teamOffset`.
    TeamId,
    /// `spare3` and `codeLimit64`.
    CodeLimit64,
    /// `execSegBase`, `execSegLimit` and `execSegFlags`.
    ExecutableSegment,
    /// `runtime` and `preEncryptOffset`.
    Runtime,
}

impl FieldGroup {
    /// All groups, in the order they appear after the fixed prefix.
    pub const ALL: [FieldGroup; 5] = [
        Self::Scatter,
        Self::TeamId,
        Self::CodeLimit64,
        Self::ExecutableSegment,
        Self::Runtime,
    ];

    /// The first code directory version containing this group.
    pub fn minimum_version(&self) -> CodeDirectoryVersion {
        match self {
            Self::Scatter => CodeDirectoryVersion::SupportsScatter,
            Self::TeamId => CodeDirectoryVersion::SupportsTeamId,
            Self::CodeLimit64 => CodeDirectoryVersion::SupportsCodeLimit64,
            Self::ExecutableSegment => CodeDirectoryVersion::SupportsExecutableSegment,
            Self::Runtime => CodeDirectoryVersion::SupportsRuntime,
        }
    }

    /// Serialized size of the group in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Scatter => 4,
            Self::TeamId => 4,
            Self::CodeLimit64 => 12,
            Self::ExecutableSegment => 24,
            Self::Runtime => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Scatter => "scatter",
            Self::TeamId => "team",
            Self::CodeLimit64 => "code limit 64",
            Self::ExecutableSegment => "executable segment",
            Self::Runtime => "runtime",
        }
    }

    /// Groups present in a header declaring `version`.
    pub fn present_in(version: u32) -> impl Iterator<Item = FieldGroup> {
        Self::ALL
            .into_iter()
            .take_while(move |group| u32::from(group.minimum_version()) <= version)
    }
}

/// The fixed layout header of a code directory.
///
/// Fields belonging to a [FieldGroup] not present in `version` are 0 and
/// are neither serialized nor parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeDirectoryHeader {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// Offset of the first code hash.
    pub hash_offset: u32,
    /// Offset of the identifier string.
    pub ident_offset: u32,
    /// Number of special hash slots preceding `hash_offset`.
    pub n_special_slots: u32,
    /// Number of ordinary code hash slots.
    pub n_code_slots: u32,
    /// Limit to main image signature range.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// log2 of the page size.
    pub page_size_log2: u8,
    /// Unused (must be 0).
    pub spare2: u32,
    // Version 0x20100
    pub scatter_offset: u32,
    // Version 0x20200
    pub team_offset: u32,
    // Version 0x20300
    /// Unused (must be 0).
    pub spare3: u32,
    pub code_limit_64: u64,
    // Version 0x20400
    pub exec_seg_base: u64,
    pub exec_seg_limit: u64,
    pub exec_seg_flags: ExecutableSegmentFlags,
    // Version 0x20500
    pub runtime: u32,
    pub pre_encrypt_offset: u32,
}

impl Default for CodeDirectoryHeader {
    fn default() -> Self {
        Self {
            version: CodeDirectoryVersion::Initial as u32,
            flags: CodeSignatureFlags::empty(),
            hash_offset: 0,
            ident_offset: 0,
            n_special_slots: 0,
            n_code_slots: 0,
            code_limit: 0,
            hash_size: 0,
            hash_type: DigestType::None,
            platform: 0,
            page_size_log2: 0,
            spare2: 0,
            scatter_offset: 0,
            team_offset: 0,
            spare3: 0,
            code_limit_64: 0,
            exec_seg_base: 0,
            exec_seg_limit: 0,
            exec_seg_flags: ExecutableSegmentFlags::empty(),
            runtime: 0,
            pre_encrypt_offset: 0,
        }
    }
}

impl CodeDirectoryHeader {
    /// Serialized size of this header given its declared version.
    pub fn size(&self) -> usize {
        CODE_DIRECTORY_FIXED_SIZE
            + FieldGroup::present_in(self.version)
                .map(|group| group.size())
                .sum::<usize>()
    }

    /// Page size in bytes.
    ///
    /// `None` if the recorded log2 does not fit a u32.
    pub fn page_size(&self) -> Option<u32> {
        1u32.checked_shl(self.page_size_log2 as u32)
    }

    /// Whether a field group holds any non-zero value.
    fn group_is_set(&self, group: FieldGroup) -> bool {
        match group {
            FieldGroup::Scatter => self.scatter_offset != 0,
            FieldGroup::TeamId => self.team_offset != 0,
            FieldGroup::CodeLimit64 => self.spare3 != 0 || self.code_limit_64 != 0,
            FieldGroup::ExecutableSegment => {
                self.exec_seg_base != 0
                    || self.exec_seg_limit != 0
                    || !self.exec_seg_flags.is_empty()
            }
            FieldGroup::Runtime => self.runtime != 0 || self.pre_encrypt_offset != 0,
        }
    }

    /// Ensure no field is set that the declared version cannot encode.
    pub fn validate_version(&self) -> Result<(), MachOSignatureError> {
        for group in FieldGroup::ALL {
            let minimum = u32::from(group.minimum_version());

            if self.version < minimum && self.group_is_set(group) {
                return Err(MachOSignatureError::CodeDirectoryFieldRequiresVersion(
                    group.name(),
                    minimum,
                ));
            }
        }

        Ok(())
    }

    /// Parse a header from the start of a code directory payload.
    ///
    /// Only the field groups covered by the declared version are read.
    pub fn parse(data: &[u8]) -> Result<Self, MachOSignatureError> {
        let offset = &mut 0;

        let version = data.gread_with::<u32>(offset, SIGNING_ORDER)?;
        let flags = data.gread_with::<u32>(offset, SIGNING_ORDER)?;

        let mut header = Self {
            version,
            flags: CodeSignatureFlags::from_bits_truncate(flags),
            hash_offset: data.gread_with(offset, SIGNING_ORDER)?,
            ident_offset: data.gread_with(offset, SIGNING_ORDER)?,
            n_special_slots: data.gread_with(offset, SIGNING_ORDER)?,
            n_code_slots: data.gread_with(offset, SIGNING_ORDER)?,
            code_limit: data.gread_with(offset, SIGNING_ORDER)?,
            hash_size: data.gread_with(offset, SIGNING_ORDER)?,
            hash_type: data.gread_with::<u8>(offset, SIGNING_ORDER)?.into(),
            platform: data.gread_with(offset, SIGNING_ORDER)?,
            page_size_log2: data.gread_with(offset, SIGNING_ORDER)?,
            spare2: data.gread_with(offset, SIGNING_ORDER)?,
            ..Default::default()
        };

        for group in FieldGroup::present_in(version) {
            match group {
                FieldGroup::Scatter => {
                    header.scatter_offset = data.gread_with(offset, SIGNING_ORDER)?;
                }
                FieldGroup::TeamId => {
                    header.team_offset = data.gread_with(offset, SIGNING_ORDER)?;
                }
                FieldGroup::CodeLimit64 => {
                    header.spare3 = data.gread_with(offset, SIGNING_ORDER)?;
                    header.code_limit_64 = data.gread_with(offset, SIGNING_ORDER)?;
                }
                FieldGroup::ExecutableSegment => {
                    header.exec_seg_base = data.gread_with(offset, SIGNING_ORDER)?;
                    header.exec_seg_limit = data.gread_with(offset, SIGNING_ORDER)?;
                    header.exec_seg_flags = ExecutableSegmentFlags::from_bits_truncate(
                        data.gread_with(offset, SIGNING_ORDER)?,
                    );
                }
                FieldGroup::Runtime => {
                    header.runtime = data.gread_with(offset, SIGNING_ORDER)?;
                    header.pre_encrypt_offset = data.gread_with(offset, SIGNING_ORDER)?;
                }
            }
        }

        Ok(header)
    }

    /// Serialize the header, writing only the groups its version covers.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), MachOSignatureError> {
        self.validate_version()?;

        writer.iowrite_with(self.version, SIGNING_ORDER)?;
        writer.iowrite_with(self.flags.bits(), SIGNING_ORDER)?;
        writer.iowrite_with(self.hash_offset, SIGNING_ORDER)?;
        writer.iowrite_with(self.ident_offset, SIGNING_ORDER)?;
        writer.iowrite_with(self.n_special_slots, SIGNING_ORDER)?;
        writer.iowrite_with(self.n_code_slots, SIGNING_ORDER)?;
        writer.iowrite_with(self.code_limit, SIGNING_ORDER)?;
        writer.iowrite_with(self.hash_size, SIGNING_ORDER)?;
        writer.iowrite_with(u8::from(self.hash_type), SIGNING_ORDER)?;
        writer.iowrite_with(self.platform, SIGNING_ORDER)?;
        writer.iowrite_with(self.page_size_log2, SIGNING_ORDER)?;
        writer.iowrite_with(self.spare2, SIGNING_ORDER)?;

        for group in FieldGroup::present_in(self.version) {
            match group {
                FieldGroup::Scatter => {
                    writer.iowrite_with(self.scatter_offset, SIGNING_ORDER)?;
                }
                FieldGroup::TeamId => {
                    writer.iowrite_with(self.team_offset, SIGNING_ORDER)?;
                }
                FieldGroup::CodeLimit64 => {
                    writer.iowrite_with(self.spare3, SIGNING_ORDER)?;
                    writer.iowrite_with(self.code_limit_64, SIGNING_ORDER)?;
                }
                FieldGroup::ExecutableSegment => {
                    writer.iowrite_with(self.exec_seg_base, SIGNING_ORDER)?;
                    writer.iowrite_with(self.exec_seg_limit, SIGNING_ORDER)?;
                    writer.iowrite_with(self.exec_seg_flags.bits(), SIGNING_ORDER)?;
                }
                FieldGroup::Runtime => {
                    writer.iowrite_with(self.runtime, SIGNING_ORDER)?;
                    writer.iowrite_with(self.pre_encrypt_offset, SIGNING_ORDER)?;
                }
            }
        }

        Ok(())
    }
}

/// Read a NULL terminated string at a blob relative offset of a payload.
///
/// `error` is returned if the offset is out of range, the string is not
/// terminated or it is not UTF-8.
fn read_c_string(
    payload: &[u8],
    blob_offset: u32,
    error: MachOSignatureError,
) -> Result<String, MachOSignatureError> {
    let data = match (blob_offset as usize)
        .checked_sub(BLOB_HEADER_SIZE)
        .and_then(|start| payload.get(start..))
    {
        Some(data) => data,
        None => return Err(error),
    };

    match data.iter().position(|b| *b == 0) {
        Some(end) => match std::str::from_utf8(&data[..end]) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(error),
        },
        None => Err(error),
    }
}

/// A code directory: header, identifier and hash tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeDirectory {
    header: CodeDirectoryHeader,
    ident: String,
    team_id: Option<String>,
    special_hashes: BTreeMap<CodeSigningSlot, Vec<u8>>,
    code_hashes: Vec<Vec<u8>>,
}

impl CodeDirectory {
    pub fn header(&self) -> &CodeDirectoryHeader {
        &self.header
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// Digests of special slots, keyed by slot.
    ///
    /// Slots whose recorded digest is all zeros are absent.
    pub fn special_hashes(&self) -> &BTreeMap<CodeSigningSlot, Vec<u8>> {
        &self.special_hashes
    }

    /// Digests of code pages, in page order.
    pub fn code_hashes(&self) -> &[Vec<u8>] {
        &self.code_hashes
    }

    /// Serialize the payload: header, strings, special hashes, code hashes.
    pub fn serialize_payload(&self) -> Result<Vec<u8>, MachOSignatureError> {
        let mut res = Vec::new();

        self.header.write_to(&mut res)?;

        res.write_all(self.ident.as_bytes())?;
        res.write_all(b"\0")?;

        if let Some(team) = &self.team_id {
            if self.header.team_offset != 0 {
                res.write_all(team.as_bytes())?;
                res.write_all(b"\0")?;
            }
        }

        // Special slots are stored in descending slot order so that slot N is
        // N hashes before the first code hash.
        let hash_size = self.header.hash_size as usize;
        for slot_index in (1..self.header.n_special_slots + 1).rev() {
            match self.special_hashes.get(&CodeSigningSlot::from(slot_index)) {
                Some(hash) => res.write_all(hash)?,
                None => res.write_all(&b"\0".repeat(hash_size))?,
            }
        }

        for hash in &self.code_hashes {
            res.write_all(hash)?;
        }

        Ok(res)
    }

    /// Convert to a code directory blob.
    pub fn to_blob(&self) -> Result<Blob, MachOSignatureError> {
        Ok(Blob::new(
            CodeSigningMagic::CodeDirectory,
            self.serialize_payload()?,
        ))
    }

    /// Parse a code directory from a blob.
    pub fn from_blob(blob: &Blob) -> Result<Self, MachOSignatureError> {
        if blob.magic() != CodeSigningMagic::CodeDirectory {
            return Err(MachOSignatureError::BadMagic("code directory blob"));
        }

        let payload = blob.payload();
        let header = CodeDirectoryHeader::parse(payload)?;

        let ident = read_c_string(
            payload,
            header.ident_offset,
            MachOSignatureError::CodeDirectoryMalformedIdentifier,
        )?;

        let team_id = if header.team_offset != 0 {
            Some(read_c_string(
                payload,
                header.team_offset,
                MachOSignatureError::CodeDirectoryMalformedTeam,
            )?)
        } else {
            None
        };

        let hash_size = header.hash_size as usize;
        let code_start = (header.hash_offset as usize)
            .checked_sub(BLOB_HEADER_SIZE)
            .ok_or(MachOSignatureError::CodeDirectoryMalformed("hash offset"))?;
        let special_start = code_start
            .checked_sub(hash_size * header.n_special_slots as usize)
            .ok_or(MachOSignatureError::CodeDirectoryMalformed(
                "special slot count",
            ))?;
        let code_end = code_start + hash_size * header.n_code_slots as usize;

        let special_data = payload
            .get(special_start..code_start)
            .ok_or(MachOSignatureError::CodeDirectoryMalformed("special hashes"))?;
        let code_data = payload
            .get(code_start..code_end)
            .ok_or(MachOSignatureError::CodeDirectoryMalformed("code hashes"))?;

        let (special_hashes, code_hashes) = if hash_size == 0 {
            (BTreeMap::new(), vec![])
        } else {
            let special_hashes = special_data
                .chunks(hash_size)
                .enumerate()
                .filter(|(_, hash)| hash.iter().any(|b| *b != 0))
                .map(|(i, hash)| {
                    (
                        CodeSigningSlot::from(header.n_special_slots - i as u32),
                        hash.to_vec(),
                    )
                })
                .collect::<BTreeMap<_, _>>();

            let code_hashes = code_data
                .chunks(hash_size)
                .map(|hash| hash.to_vec())
                .collect::<Vec<_>>();

            (special_hashes, code_hashes)
        };

        Ok(Self {
            header,
            ident,
            team_id,
            special_hashes,
            code_hashes,
        })
    }

    /// Parse a code directory from serialized blob bytes.
    pub fn from_blob_bytes(data: &[u8]) -> Result<Self, MachOSignatureError> {
        Self::from_blob(&Blob::parse(data)?)
    }
}

/// Constructs a [CodeDirectory] from already computed page hashes.
///
/// Offsets and counts are derived when [CodeDirectoryBuilder::build] is
/// called. Setting a field that requires a newer version than the one
/// requested is an error at build time.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBuilder {
    version: u32,
    flags: CodeSignatureFlags,
    hash_type: DigestType,
    ident: String,
    team_id: Option<String>,
    platform: u8,
    page_size_log2: u8,
    code_limit: u64,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: ExecutableSegmentFlags,
    runtime: u32,
    pre_encrypt_offset: u32,
    special_hashes: BTreeMap<CodeSigningSlot, Vec<u8>>,
    code_hashes: Vec<Vec<u8>>,
}

impl CodeDirectoryBuilder {
    /// Start building a code directory.
    pub fn new(ident: impl ToString, hash_type: DigestType, code_hashes: Vec<Vec<u8>>) -> Self {
        Self {
            version: CodeDirectoryVersion::SupportsExecutableSegment as u32,
            flags: CodeSignatureFlags::empty(),
            hash_type,
            ident: ident.to_string(),
            team_id: None,
            platform: 0,
            page_size_log2: 12,
            code_limit: 0,
            exec_seg_base: 0,
            exec_seg_limit: 0,
            exec_seg_flags: ExecutableSegmentFlags::empty(),
            runtime: 0,
            pre_encrypt_offset: 0,
            special_hashes: BTreeMap::new(),
            code_hashes,
        }
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn set_flags(&mut self, flags: CodeSignatureFlags) {
        self.flags = flags;
    }

    pub fn set_team_id(&mut self, team_id: impl ToString) {
        self.team_id = Some(team_id.to_string());
    }

    pub fn set_platform(&mut self, platform: u8) {
        self.platform = platform;
    }

    /// Set the page size, expressed as log2 of the size in bytes.
    pub fn set_page_size_log2(&mut self, bits: u8) {
        self.page_size_log2 = bits;
    }

    /// Set the file offset at which code digesting stopped.
    pub fn set_code_limit(&mut self, limit: u64) {
        self.code_limit = limit;
    }

    pub fn set_executable_segment(
        &mut self,
        base: u64,
        limit: u64,
        flags: ExecutableSegmentFlags,
    ) {
        self.exec_seg_base = base;
        self.exec_seg_limit = limit;
        self.exec_seg_flags = flags;
    }

    /// Set the hardened runtime version, in Mach-O nibble encoding.
    pub fn set_runtime(&mut self, runtime: u32) {
        self.runtime = runtime;
    }

    pub fn set_pre_encrypt_offset(&mut self, offset: u32) {
        self.pre_encrypt_offset = offset;
    }

    /// Record the digest of another blob in a special slot.
    pub fn set_special_hash(
        &mut self,
        slot: CodeSigningSlot,
        digest: Vec<u8>,
    ) -> Result<(), MachOSignatureError> {
        if !slot.is_code_directory_specials_expressible() {
            return Err(MachOSignatureError::CodeDirectoryMalformed(
                "slot not expressible as special hash",
            ));
        }

        self.special_hashes.insert(slot, digest);

        Ok(())
    }

    /// Lay out the code directory.
    pub fn build(self) -> Result<CodeDirectory, MachOSignatureError> {
        if self.version < CodeDirectoryVersion::Initial as u32 {
            return Err(MachOSignatureError::CodeDirectoryMalformed(
                "unsupported version",
            ));
        }

        let hash_size = self.hash_type.hash_len()?;
        if self
            .code_hashes
            .iter()
            .chain(self.special_hashes.values())
            .any(|hash| hash.len() != hash_size)
        {
            return Err(MachOSignatureError::CodeDirectoryMalformed(
                "digest length does not match hash type",
            ));
        }

        let (code_limit, code_limit_64) = match u32::try_from(self.code_limit) {
            Ok(limit) => (limit, 0),
            Err(_) => (u32::MAX, self.code_limit),
        };

        let supports_team = self.version >= CodeDirectoryVersion::SupportsTeamId as u32;
        if self.team_id.is_some() && !supports_team {
            return Err(MachOSignatureError::CodeDirectoryFieldRequiresVersion(
                FieldGroup::TeamId.name(),
                CodeDirectoryVersion::SupportsTeamId as u32,
            ));
        }

        let n_special_slots = self
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        let mut header = CodeDirectoryHeader {
            version: self.version,
            flags: self.flags,
            hash_offset: 0,
            ident_offset: 0,
            n_special_slots,
            n_code_slots: self.code_hashes.len() as u32,
            code_limit,
            hash_size: hash_size as u8,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size_log2: self.page_size_log2,
            spare2: 0,
            scatter_offset: 0,
            team_offset: 0,
            spare3: 0,
            code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
        };

        // Placeholder team offset so the version check sees the field in use.
        if self.team_id.is_some() {
            header.team_offset = u32::MAX;
        }
        header.validate_version()?;

        let ident_offset = BLOB_HEADER_SIZE + header.size();
        let mut cursor = ident_offset + self.ident.len() + 1;

        if let Some(team) = &self.team_id {
            header.team_offset = cursor as u32;
            cursor += team.len() + 1;
        }

        let hash_offset = cursor + hash_size * n_special_slots as usize;

        header.ident_offset = ident_offset as u32;
        header.hash_offset = hash_offset as u32;

        let cd = CodeDirectory {
            header,
            ident: self.ident,
            team_id: self.team_id,
            special_hashes: self.special_hashes,
            code_hashes: self.code_hashes,
        };

        // The offsets must agree with what serialization actually emits.
        let length = BLOB_HEADER_SIZE + cd.serialize_payload()?.len();
        if hash_size * cd.header.n_code_slots as usize + hash_offset > length {
            return Err(MachOSignatureError::CodeDirectoryMalformed(
                "code hashes exceed code directory length",
            ));
        }

        Ok(cd)
    }
}
