// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-place patching of Mach-O binaries.
//!
//! [File] owns an open handle to a thin Mach-O binary along with a parsed
//! model of its header and load commands. Every mutation funnels through
//! [File::patch], which writes bytes at an offset and then closes, reopens
//! and re-parses the file so the model always reflects what is on disk.
//!
//! Two byte orders are in play. Mach-O structures use the byte order of the
//! binary (tracked in the container [Ctx]). Code signing structures are
//! always big-endian.
//!
//! A binary moves through these states as it is signed:
//!
//! * unsigned: no `LC_CODE_SIGNATURE` load command.
//! * empty signed: the command exists with a data offset at the end of
//!   `__LINKEDIT` ([File::add_empty_code_signing_cmd]).
//! * signed: the command records the superblob size
//!   ([File::update_code_signing_cmd_data_size]) and the superblob is written.
//!
//! [File::remove_signing_content] returns a binary to the unsigned state.

use {
    crate::{
        code_hash::{paged_digests, PAGE_SIZE},
        error::MachOSignatureError,
        superblob::SuperBlob,
    },
    digest::DynDigest,
    goblin::{
        container::Ctx,
        mach::{
            constants::{SEG_LINKEDIT, SEG_TEXT},
            fat::FAT_MAGIC,
            header::{Header, MH_EXECUTE},
            load_command::{
                CommandVariant, LinkeditDataCommand, SegmentCommand32, SegmentCommand64,
                LC_BUILD_VERSION, LC_CODE_SIGNATURE, SIZEOF_LINKEDIT_DATA_COMMAND,
            },
            parse_magic_and_ctx, Mach, MachO,
        },
    },
    log::{debug, trace},
    scroll::{ctx::SizeWith, IOwrite, Pread},
    std::{
        fs::OpenOptions,
        io::{Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
};

/// The `LC_CODE_SIGNATURE` load command.
///
/// `dataoff` and `datasize` describe the superblob's byte range within `__LINKEDIT`.
pub type CodeSigningCommand = LinkeditDataCommand;

/// Content of an `LC_BUILD_VERSION` load command.
#[derive(Clone, Debug, Pread)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    /// sizeof(self) + self.ntools * sizeof(BuildToolsVersion)
    pub cmdsize: u32,
    /// Platform identifier.
    pub platform: u32,
    /// Minimum operating system version, nibble encoded.
    pub minos: u32,
    /// SDK version, nibble encoded.
    pub sdk: u32,
    /// Number of tools entries following this structure.
    pub ntools: u32,
}

/// A segment load command of either width.
#[derive(Clone, Copy, Debug)]
pub enum SegmentCommand {
    Segment32(SegmentCommand32),
    Segment64(SegmentCommand64),
}

/// A segment load command and where it lives in the file.
#[derive(Clone, Debug)]
pub struct SegmentHeader {
    pub name: String,
    /// File offset of the load command.
    pub command_offset: usize,
    pub command: SegmentCommand,
}

impl SegmentHeader {
    pub fn fileoff(&self) -> u64 {
        match &self.command {
            SegmentCommand::Segment32(s) => s.fileoff as u64,
            SegmentCommand::Segment64(s) => s.fileoff,
        }
    }

    pub fn filesize(&self) -> u64 {
        match &self.command {
            SegmentCommand::Segment32(s) => s.filesize as u64,
            SegmentCommand::Segment64(s) => s.filesize,
        }
    }

    pub fn vmaddr(&self) -> u64 {
        match &self.command {
            SegmentCommand::Segment32(s) => s.vmaddr as u64,
            SegmentCommand::Segment64(s) => s.vmaddr,
        }
    }

    pub fn vmsize(&self) -> u64 {
        match &self.command {
            SegmentCommand::Segment32(s) => s.vmsize as u64,
            SegmentCommand::Segment64(s) => s.vmsize,
        }
    }

    /// File offset one past the segment's last byte.
    pub fn file_end(&self) -> u64 {
        self.fileoff() + self.filesize()
    }
}

/// A load command's position and identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadCommandRecord {
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
}

/// Owned, parsed view of the Mach-O header and load commands.
#[derive(Clone, Debug)]
struct ParsedMachO {
    header: Header,
    ctx: Ctx,
    load_commands: Vec<LoadCommandRecord>,
    segments: Vec<SegmentHeader>,
    code_signature: Option<(CodeSigningCommand, usize)>,
    sdk_version: Option<u32>,
}

impl ParsedMachO {
    fn parse(data: &[u8]) -> Result<Self, MachOSignatureError> {
        let macho = match Mach::parse(data)? {
            Mach::Binary(macho) => macho,
            Mach::Fat(_) => return Err(MachOSignatureError::UnsupportedUniversalBinary),
        };

        let ctx = parse_magic_and_ctx(data, 0)?
            .1
            .ok_or_else(|| MachOSignatureError::InvalidBinary("unknown Mach-O magic".into()))?;

        Self::from_macho(data, &macho, ctx)
    }

    fn from_macho(data: &[u8], macho: &MachO, ctx: Ctx) -> Result<Self, MachOSignatureError> {
        let mut load_commands = Vec::with_capacity(macho.load_commands.len());
        let mut segments = vec![];
        let mut code_signature = None;
        let mut sdk_version = None;

        for lc in &macho.load_commands {
            load_commands.push(LoadCommandRecord {
                offset: lc.offset,
                cmd: lc.command.cmd(),
                cmdsize: lc.command.cmdsize() as u32,
            });

            match &lc.command {
                CommandVariant::Segment32(segment) => {
                    segments.push(SegmentHeader {
                        name: segment.name()?.to_string(),
                        command_offset: lc.offset,
                        command: SegmentCommand::Segment32(*segment),
                    });
                }
                CommandVariant::Segment64(segment) => {
                    segments.push(SegmentHeader {
                        name: segment.name()?.to_string(),
                        command_offset: lc.offset,
                        command: SegmentCommand::Segment64(*segment),
                    });
                }
                CommandVariant::CodeSignature(command) => {
                    code_signature = Some((*command, lc.offset));
                }
                _ if lc.command.cmd() == LC_BUILD_VERSION => {
                    let command = data.pread_with::<BuildVersionCommand>(lc.offset, ctx.le)?;
                    sdk_version = Some(command.sdk);
                }
                _ => {}
            }
        }

        Ok(Self {
            header: macho.header,
            ctx,
            load_commands,
            segments,
            code_signature,
            sdk_version,
        })
    }
}

/// Whether a file is a Mach-O binary (thin or universal).
///
/// Only the leading magic is read. Files shorter than the magic are not
/// Mach-O. I/O errors are returned.
pub fn is_macho_file(path: impl AsRef<Path>) -> Result<bool, MachOSignatureError> {
    let mut fh = std::fs::File::open(path.as_ref())?;

    let mut magic = [0u8; 4];
    match fh.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let (magic, ctx) = parse_magic_and_ctx(&magic, 0)?;

    Ok(magic == FAT_MAGIC || ctx.is_some())
}

/// Parse a Mach-O version nibble encoded value into a [semver::Version].
pub fn parse_version_nibbles(v: u32) -> semver::Version {
    let major = v >> 16;
    let minor = v << 16 >> 24;
    let patch = v & 0xff;

    semver::Version::new(major as _, minor as _, patch as _)
}

/// Convert a [semver::Version] to a u32 with nibble encoding used by Mach-O.
pub fn semver_to_macho_target_version(version: &semver::Version) -> u32 {
    let major = version.major as u32;
    let minor = version.minor as u32;
    let patch = version.patch as u32;

    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

/// A thin Mach-O binary opened for inspection and in-place patching.
pub struct File {
    path: PathBuf,
    writable: bool,
    fh: std::fs::File,
    macho: ParsedMachO,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("ncmds", &self.macho.header.ncmds)
            .finish()
    }
}

impl File {
    /// Open a binary for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MachOSignatureError> {
        Self::open_with(path.as_ref(), true)
    }

    /// Open a binary for reading only.
    ///
    /// Every mutating operation fails with [MachOSignatureError::ReadOnly].
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, MachOSignatureError> {
        Self::open_with(path.as_ref(), false)
    }

    fn open_with(path: &Path, writable: bool) -> Result<Self, MachOSignatureError> {
        let (fh, macho) = Self::load(path, writable)?;

        Ok(Self {
            path: path.to_path_buf(),
            writable,
            fh,
            macho,
        })
    }

    fn load(
        path: &Path,
        writable: bool,
    ) -> Result<(std::fs::File, ParsedMachO), MachOSignatureError> {
        let mut fh = OpenOptions::new().read(true).write(writable).open(path)?;

        let mut data = vec![];
        fh.read_to_end(&mut data)?;
        fh.seek(SeekFrom::Start(0))?;

        let macho = ParsedMachO::parse(&data)?;

        Ok((fh, macho))
    }

    /// Close, reopen and re-parse the file.
    fn refresh(&mut self) -> Result<(), MachOSignatureError> {
        trace!("re-parsing {}", self.path.display());
        let (fh, macho) = Self::load(&self.path, self.writable)?;

        self.fh = fh;
        self.macho = macho;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn header(&self) -> &Header {
        &self.macho.header
    }

    /// The container context: word size and Mach-O byte order.
    pub fn ctx(&self) -> Ctx {
        self.macho.ctx
    }

    /// Whether this is a main executable.
    pub fn is_executable(&self) -> bool {
        self.macho.header.filetype == MH_EXECUTE
    }

    /// SDK version from `LC_BUILD_VERSION`, in nibble encoding.
    pub fn sdk_version(&self) -> Option<u32> {
        self.macho.sdk_version
    }

    pub fn load_commands(&self) -> &[LoadCommandRecord] {
        &self.macho.load_commands
    }

    pub fn segments(&self) -> &[SegmentHeader] {
        &self.macho.segments
    }

    /// Find a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentHeader> {
        self.macho.segments.iter().find(|s| s.name == name)
    }

    pub fn linkedit_segment(&self) -> Result<&SegmentHeader, MachOSignatureError> {
        self.segment(SEG_LINKEDIT)
            .ok_or(MachOSignatureError::MissingLinkedit)
    }

    pub fn text_segment(&self) -> Result<&SegmentHeader, MachOSignatureError> {
        self.segment(SEG_TEXT).ok_or(MachOSignatureError::MissingText)
    }

    /// File offset of the first load command.
    pub fn first_cmd_offset(&self) -> usize {
        Header::size_with(&self.macho.ctx)
    }

    /// File offset just past the last load command.
    pub fn next_cmd_offset(&self) -> usize {
        self.first_cmd_offset() + self.macho.header.sizeofcmds as usize
    }

    /// The code signing load command and its file offset.
    pub fn code_signing_cmd(&self) -> Option<(CodeSigningCommand, usize)> {
        self.macho.code_signature
    }

    pub fn has_code_signing_cmd(&self) -> bool {
        self.macho.code_signature.is_some()
    }

    /// Whether no load command follows the code signing command.
    ///
    /// True when there is no code signing command.
    pub fn is_signing_command_last_loader(&self) -> bool {
        let mut found = false;

        for lc in &self.macho.load_commands {
            if found {
                return false;
            }

            if lc.cmd == LC_CODE_SIGNATURE {
                found = true;
            }
        }

        true
    }

    /// Read `size` bytes at a file offset.
    fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>, MachOSignatureError> {
        let mut fh = &self.fh;
        fh.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; size];
        fh.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Whether a new load command fits after the existing ones.
    ///
    /// The bytes where the command would go must all be zero. This is a
    /// conservative check: the region between the load commands and the
    /// first section's data is conventionally zero filled, but we don't
    /// compute the true free space.
    fn has_room_for_new_cmd(&self) -> bool {
        match self.read_at(
            self.next_cmd_offset() as u64,
            SIZEOF_LINKEDIT_DATA_COMMAND,
        ) {
            Ok(buffer) => buffer.iter().all(|b| *b == 0),
            Err(_) => false,
        }
    }

    fn ensure_writable(&self) -> Result<(), MachOSignatureError> {
        if self.writable {
            Ok(())
        } else {
            Err(MachOSignatureError::ReadOnly)
        }
    }

    fn header_bytes(&self, header: Header) -> Result<Vec<u8>, MachOSignatureError> {
        let mut res = Vec::with_capacity(self.first_cmd_offset());
        res.iowrite_with(header, self.macho.ctx)?;

        Ok(res)
    }

    /// Write `size` bytes of `content` at `offset`, then re-parse the file.
    ///
    /// Any error leaves the file in an unknown state: the write may have
    /// completed even if re-parsing failed.
    pub fn patch(
        &mut self,
        content: &[u8],
        size: usize,
        offset: u64,
    ) -> Result<(), MachOSignatureError> {
        self.ensure_writable()?;

        if size > content.len() {
            return Err(MachOSignatureError::PatchOutOfBounds {
                size,
                available: content.len(),
            });
        }

        trace!("patching {} bytes at offset {:#x}", size, offset);
        self.fh.seek(SeekFrom::Start(offset))?;
        self.fh.write_all(&content[..size])?;
        self.fh.flush()?;

        self.refresh()
    }

    /// Truncate or extend the file, then re-parse it.
    pub fn set_len(&mut self, len: u64) -> Result<(), MachOSignatureError> {
        self.ensure_writable()?;

        trace!("setting file length to {:#x}", len);
        self.fh.set_len(len)?;

        self.refresh()
    }

    /// Add an `LC_CODE_SIGNATURE` command with a data size of 0.
    ///
    /// The data offset is the end of `__LINKEDIT`, which holds no signature
    /// data yet.
    pub fn add_empty_code_signing_cmd(&mut self) -> Result<(), MachOSignatureError> {
        self.ensure_writable()?;

        if self.has_code_signing_cmd() {
            return Err(MachOSignatureError::CodeSigningCommandExists);
        }
        if !self.has_room_for_new_cmd() {
            return Err(MachOSignatureError::LoadCommandNoRoom);
        }

        let dataoff = u32::try_from(self.linkedit_segment()?.file_end())
            .map_err(|_| MachOSignatureError::InvalidBinary("__LINKEDIT end exceeds 4 GB".into()))?;

        let command = CodeSigningCommand {
            cmd: LC_CODE_SIGNATURE,
            cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
            dataoff,
            datasize: 0,
        };

        debug!(
            "adding empty code signing load command at {:#x} pointing to {:#x}",
            self.next_cmd_offset(),
            dataoff
        );

        let mut header = self.macho.header;
        header.ncmds += 1;
        header.sizeofcmds += command.cmdsize;
        let header_data = self.header_bytes(header)?;

        let mut command_data = Vec::with_capacity(SIZEOF_LINKEDIT_DATA_COMMAND);
        command_data.iowrite_with(command, self.macho.ctx.le)?;

        let command_offset = self.next_cmd_offset() as u64;
        self.patch(&command_data, command_data.len(), command_offset)?;
        self.patch(&header_data, header_data.len(), 0)
    }

    /// Overwrite the data size of the existing code signing command.
    pub fn update_code_signing_cmd_data_size(
        &mut self,
        new_size: u32,
    ) -> Result<(), MachOSignatureError> {
        self.ensure_writable()?;

        let (mut command, offset) = self
            .code_signing_cmd()
            .ok_or(MachOSignatureError::NoCodeSigningCommand)?;

        debug!("updating code signing data size to {}", new_size);
        command.datasize = new_size;

        let mut data = Vec::with_capacity(SIZEOF_LINKEDIT_DATA_COMMAND);
        data.iowrite_with(command, self.macho.ctx.le)?;

        self.patch(&data, data.len(), offset as u64)
    }

    /// Rewrite the file and memory sizes of a named segment.
    ///
    /// The file must already contain `filesize` bytes of segment data, or
    /// re-parsing fails.
    pub fn update_segment_sizes(
        &mut self,
        name: &str,
        filesize: u64,
        vmsize: u64,
    ) -> Result<(), MachOSignatureError> {
        self.ensure_writable()?;

        let segment = self
            .segment(name)
            .ok_or_else(|| MachOSignatureError::InvalidBinary(format!("no segment {}", name)))?
            .clone();

        debug!(
            "updating segment {}: filesize {:#x}, vmsize {:#x}",
            name, filesize, vmsize
        );

        let le = self.macho.ctx.le;
        let mut data = vec![];

        match segment.command {
            SegmentCommand::Segment32(mut command) => {
                let too_large =
                    || MachOSignatureError::InvalidBinary("segment size exceeds 32 bits".into());
                command.filesize = u32::try_from(filesize).map_err(|_| too_large())?;
                command.vmsize = u32::try_from(vmsize).map_err(|_| too_large())?;

                data.iowrite_with(command, le)?;
                debug_assert_eq!(data.len(), SegmentCommand32::size_with(&le));
            }
            SegmentCommand::Segment64(mut command) => {
                command.filesize = filesize;
                command.vmsize = vmsize;

                data.iowrite_with(command, le)?;
                debug_assert_eq!(data.len(), SegmentCommand64::size_with(&le));
            }
        }

        self.patch(&data, data.len(), segment.command_offset as u64)
    }

    /// Remove the code signing command and zero the signature data.
    ///
    /// Only a code signing command that is the last load command can be
    /// removed. Otherwise the file is left untouched and an error returned.
    /// Does nothing if there is no code signing command.
    pub fn remove_signing_content(&mut self) -> Result<(), MachOSignatureError> {
        let (command, offset) = match self.code_signing_cmd() {
            Some(v) => v,
            None => return Ok(()),
        };

        self.ensure_writable()?;

        if !self.is_signing_command_last_loader() {
            return Err(MachOSignatureError::CodeSigningCommandNotLast);
        }

        let mut header = self.macho.header;
        header.ncmds -= 1;
        header.sizeofcmds -= command.cmdsize;
        let header_data = self.header_bytes(header)?;

        debug!("removing code signing load command at {:#x}", offset);
        self.patch(&header_data, header_data.len(), 0)?;

        trace!("overwriting code signing load command with zeros");
        let zeros = vec![0u8; command.cmdsize as usize];
        self.patch(&zeros, zeros.len(), offset as u64)?;

        trace!("overwriting superblob with zeros");
        let zeros = vec![0u8; command.datasize as usize];
        self.patch(&zeros, zeros.len(), command.dataoff as u64)
    }

    /// Hash every page of the file preceding the signature data.
    ///
    /// Requires the code signing command, as its data offset marks the end
    /// of the hashed range.
    pub fn hash_pages(
        &self,
        hasher: &mut dyn DynDigest,
    ) -> Result<Vec<Vec<u8>>, MachOSignatureError> {
        let (command, _) = self
            .code_signing_cmd()
            .ok_or(MachOSignatureError::NoCodeSigningCommand)?;

        let data = self.read_at(0, command.dataoff as usize)?;
        let hashes = paged_digests(&data, hasher, PAGE_SIZE);

        trace!(
            "hashed {} pages up to offset {:#x}",
            hashes.len(),
            command.dataoff
        );

        Ok(hashes)
    }

    /// Read and parse the superblob referenced by the code signing command.
    pub fn superblob(&self) -> Result<SuperBlob, MachOSignatureError> {
        let (command, _) = self
            .code_signing_cmd()
            .ok_or(MachOSignatureError::NoCodeSigningCommand)?;

        let data = self.read_at(command.dataoff as u64, command.datasize as usize)?;

        SuperBlob::from_bytes(&data)
    }

    /// Obtain the encoded bytes (header and payload) of the `nth` code directory.
    ///
    /// Primary and alternate code directories are counted in index order.
    /// Blob bytes are an opaque byte sequence, so the result is identical
    /// for either `order`.
    pub fn cd_bytes(
        &self,
        order: scroll::Endian,
        nth: usize,
    ) -> Result<Vec<u8>, MachOSignatureError> {
        trace!("extracting code directory #{} ({:?})", nth, order);

        self.superblob()?.nth_code_directory(nth)?.to_bytes()
    }

    /// Obtain the encoded bytes of the CMS signature blob.
    pub fn cms_blob_bytes(&self, order: scroll::Endian) -> Result<Vec<u8>, MachOSignatureError> {
        trace!("extracting CMS blob ({:?})", order);

        self.superblob()?.cms_signature()?.to_bytes()
    }

    /// Digest the primary code directory blob.
    pub fn hash_cd(&self, hasher: &mut dyn DynDigest) -> Result<Vec<u8>, MachOSignatureError> {
        let data = self.cd_bytes(scroll::LE, 0)?;

        hasher.reset();
        hasher.update(&data);

        Ok(hasher.finalize_reset().to_vec())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{
            code_directory::{CodeDirectory, CodeDirectoryBuilder},
            embedded_signature::{Blob, CodeSigningMagic, CodeSigningSlot, DigestType},
            superblob::SuperBlobBuilder,
        },
        sha2::Digest,
    };

    const TEXT_SIZE: usize = 0x1000;

    fn write_segment(
        data: &mut Vec<u8>,
        is_64: bool,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        prot: u32,
    ) {
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name.as_bytes());

        if is_64 {
            data.iowrite_with(0x19u32, scroll::LE).unwrap();
            data.iowrite_with(72u32, scroll::LE).unwrap();
            data.extend_from_slice(&segname);
            data.iowrite_with(vmaddr, scroll::LE).unwrap();
            data.iowrite_with(vmsize, scroll::LE).unwrap();
            data.iowrite_with(fileoff, scroll::LE).unwrap();
            data.iowrite_with(filesize, scroll::LE).unwrap();
        } else {
            data.iowrite_with(0x1u32, scroll::LE).unwrap();
            data.iowrite_with(56u32, scroll::LE).unwrap();
            data.extend_from_slice(&segname);
            data.iowrite_with(vmaddr as u32, scroll::LE).unwrap();
            data.iowrite_with(vmsize as u32, scroll::LE).unwrap();
            data.iowrite_with(fileoff as u32, scroll::LE).unwrap();
            data.iowrite_with(filesize as u32, scroll::LE).unwrap();
        }

        // maxprot, initprot, nsects, flags.
        data.iowrite_with(prot, scroll::LE).unwrap();
        data.iowrite_with(prot, scroll::LE).unwrap();
        data.iowrite_with(0u32, scroll::LE).unwrap();
        data.iowrite_with(0u32, scroll::LE).unwrap();
    }

    /// A minimal unsigned little-endian Mach-O executable.
    ///
    /// `__TEXT` covers the first page. `__LINKEDIT` is empty and starts at
    /// the end of the file.
    pub(crate) fn unsigned_macho(is_64: bool) -> Vec<u8> {
        let mut commands = vec![];
        let base = if is_64 { 0x1_0000_0000 } else { 0x1000 };
        write_segment(&mut commands, is_64, "__TEXT", base, 0x1000, 0, TEXT_SIZE as u64, 5);
        write_segment(
            &mut commands,
            is_64,
            "__LINKEDIT",
            base + 0x1000,
            0x4000,
            TEXT_SIZE as u64,
            0,
            1,
        );

        let mut data = vec![];
        data.iowrite_with(if is_64 { 0xfeedfacfu32 } else { 0xfeedfaceu32 }, scroll::LE)
            .unwrap();
        data.iowrite_with(if is_64 { 0x0100_0007u32 } else { 7u32 }, scroll::LE)
            .unwrap();
        data.iowrite_with(3u32, scroll::LE).unwrap();
        data.iowrite_with(MH_EXECUTE, scroll::LE).unwrap();
        data.iowrite_with(2u32, scroll::LE).unwrap();
        data.iowrite_with(commands.len() as u32, scroll::LE).unwrap();
        data.iowrite_with(0u32, scroll::LE).unwrap();
        if is_64 {
            data.iowrite_with(0u32, scroll::LE).unwrap();
        }
        data.extend(commands);

        data.resize(TEXT_SIZE, 0);
        // Some recognizable code content.
        for (i, b) in data[0x800..0x900].iter_mut().enumerate() {
            *b = i as u8;
        }

        data
    }

    pub(crate) fn write_temp_macho(
        dir: &tempfile::TempDir,
        name: &str,
        data: &[u8],
    ) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn file_digest(path: &Path) -> Vec<u8> {
        sha2::Sha256::digest(&std::fs::read(path).unwrap()).to_vec()
    }

    #[test]
    fn version_nibbles() {
        assert_eq!(
            parse_version_nibbles(12 << 16 | 1 << 8 | 2),
            semver::Version::new(12, 1, 2)
        );
        assert_eq!(
            semver_to_macho_target_version(&semver::Version::new(11, 10, 15)),
            11 << 16 | 10 << 8 | 15
        );
    }

    #[test]
    fn open_and_inspect() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        assert!(is_macho_file(&path)?);
        let not_macho = write_temp_macho(&dir, "text", b"hello world");
        assert!(!is_macho_file(&not_macho)?);
        let short = write_temp_macho(&dir, "short", b"ab");
        assert!(!is_macho_file(&short)?);
        assert!(matches!(
            is_macho_file(dir.path().join("missing")),
            Err(MachOSignatureError::Io(_))
        ));

        let file = File::open(&path)?;
        assert_eq!(file.first_cmd_offset(), 32);
        assert_eq!(file.next_cmd_offset(), 32 + 144);
        assert!(file.is_executable());
        assert!(!file.has_code_signing_cmd());
        assert_eq!(file.text_segment()?.filesize(), TEXT_SIZE as u64);
        assert_eq!(file.linkedit_segment()?.file_end(), TEXT_SIZE as u64);
        assert!(file.segment("__DATA").is_none());

        // No signing command means nothing to hash against.
        let mut hasher = sha2::Sha256::new();
        assert!(matches!(
            file.hash_pages(&mut hasher),
            Err(MachOSignatureError::NoCodeSigningCommand)
        ));

        Ok(())
    }

    #[test]
    fn sdk_version_from_build_version() -> Result<(), MachOSignatureError> {
        let mut data = unsigned_macho(true);

        // LC_BUILD_VERSION: platform macOS, minos 11.0, sdk 12.3, no tools.
        let mut command = vec![];
        for v in [LC_BUILD_VERSION, 24, 1, 11 << 16, 12 << 16 | 3 << 8, 0] {
            command.iowrite_with(v, scroll::LE)?;
        }
        data[32 + 144..32 + 144 + 24].copy_from_slice(&command);
        data[16..20].copy_from_slice(&3u32.to_le_bytes());
        data[20..24].copy_from_slice(&(144u32 + 24).to_le_bytes());

        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &data);
        let file = File::open_read_only(&path)?;
        assert_eq!(file.sdk_version(), Some(12 << 16 | 3 << 8));
        assert_eq!(
            parse_version_nibbles(file.sdk_version().unwrap_or_default()),
            semver::Version::new(12, 3, 0)
        );

        let path = write_temp_macho(&dir, "plain", &unsigned_macho(true));
        assert_eq!(File::open_read_only(&path)?.sdk_version(), None);

        Ok(())
    }

    #[test]
    fn add_empty_code_signing_cmd() -> Result<(), MachOSignatureError> {
        for is_64 in [false, true] {
            let dir = tempfile::tempdir()?;
            let path = write_temp_macho(&dir, "bin", &unsigned_macho(is_64));

            let mut file = File::open(&path)?;
            let header_size = if is_64 { 32 } else { 28 };
            let commands_size = if is_64 { 144 } else { 112 };
            assert_eq!(file.first_cmd_offset(), header_size);

            file.add_empty_code_signing_cmd()?;

            assert_eq!(file.header().ncmds, 3);
            assert_eq!(file.header().sizeofcmds, commands_size + 16);

            let (command, offset) = file.code_signing_cmd().unwrap();
            assert_eq!(offset, header_size + commands_size as usize);
            assert_eq!(command.cmdsize, 16);
            assert_eq!(command.dataoff, TEXT_SIZE as u32);
            assert_eq!(command.datasize, 0);
            assert!(file.is_signing_command_last_loader());

            assert!(matches!(
                file.add_empty_code_signing_cmd(),
                Err(MachOSignatureError::CodeSigningCommandExists)
            ));

            // The on-disk bytes are the little-endian command.
            let data = std::fs::read(&path)?;
            assert_eq!(
                &data[offset..offset + 16],
                &[0x1d, 0, 0, 0, 16, 0, 0, 0, 0, 0x10, 0, 0, 0, 0, 0, 0]
            );
        }

        Ok(())
    }

    #[test]
    fn no_room_for_new_cmd() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let mut data = unsigned_macho(true);
        data[32 + 144 + 15] = 1;
        let path = write_temp_macho(&dir, "bin", &data);
        let before = file_digest(&path);

        let mut file = File::open(&path)?;
        assert!(matches!(
            file.add_empty_code_signing_cmd(),
            Err(MachOSignatureError::LoadCommandNoRoom)
        ));
        assert_eq!(file_digest(&path), before);

        Ok(())
    }

    #[test]
    fn update_data_size_is_idempotent() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        let mut file = File::open(&path)?;
        file.add_empty_code_signing_cmd()?;

        file.update_code_signing_cmd_data_size(1234)?;
        let once = std::fs::read(&path)?;
        assert_eq!(file.code_signing_cmd().unwrap().0.datasize, 1234);

        file.update_code_signing_cmd_data_size(1234)?;
        let twice = std::fs::read(&path)?;
        assert_eq!(once, twice);

        Ok(())
    }

    #[test]
    fn update_data_size_requires_command() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        let mut file = File::open(&path)?;
        assert!(matches!(
            file.update_code_signing_cmd_data_size(1),
            Err(MachOSignatureError::NoCodeSigningCommand)
        ));

        Ok(())
    }

    #[test]
    fn read_only_refuses_writes() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));
        let before = file_digest(&path);

        let mut file = File::open_read_only(&path)?;
        assert!(!file.is_writable());
        assert!(matches!(
            file.add_empty_code_signing_cmd(),
            Err(MachOSignatureError::ReadOnly)
        ));
        assert!(matches!(
            file.patch(&[1, 2, 3], 3, 0x900),
            Err(MachOSignatureError::ReadOnly)
        ));
        assert_eq!(file_digest(&path), before);

        Ok(())
    }

    #[test]
    fn patch_bounds_checked() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        let mut file = File::open(&path)?;
        assert!(matches!(
            file.patch(&[1, 2, 3], 4, 0x900),
            Err(MachOSignatureError::PatchOutOfBounds {
                size: 4,
                available: 3
            })
        ));

        file.patch(&[1, 2, 3], 2, 0x900)?;
        let data = std::fs::read(&path)?;
        assert_eq!(&data[0x900..0x903], &[1, 2, 0]);

        Ok(())
    }

    #[test]
    fn update_segment_sizes() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        let mut file = File::open(&path)?;
        file.set_len(TEXT_SIZE as u64 + 0x100)?;
        file.update_segment_sizes("__LINKEDIT", 0x100, 0x4000)?;

        let linkedit = file.linkedit_segment()?;
        assert_eq!(linkedit.filesize(), 0x100);
        assert_eq!(linkedit.vmsize(), 0x4000);
        assert_eq!(file.text_segment()?.filesize(), TEXT_SIZE as u64);

        Ok(())
    }

    #[test]
    fn remove_signing_content() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let original = unsigned_macho(true);
        let path = write_temp_macho(&dir, "bin", &original);

        let mut file = File::open(&path)?;

        // No-op without a signing command.
        file.remove_signing_content()?;
        assert_eq!(std::fs::read(&path)?, original);

        file.add_empty_code_signing_cmd()?;
        file.patch(&[0xaa; 64], 64, TEXT_SIZE as u64)?;
        file.update_code_signing_cmd_data_size(64)?;

        file.remove_signing_content()?;
        assert!(!file.has_code_signing_cmd());
        assert_eq!(file.header().ncmds, 2);
        assert_eq!(file.header().sizeofcmds, 144);

        let data = std::fs::read(&path)?;
        assert_eq!(&data[..TEXT_SIZE], &original[..]);
        assert!(data[TEXT_SIZE..].iter().all(|b| *b == 0));

        // The command area is free again.
        file.add_empty_code_signing_cmd()?;

        Ok(())
    }

    #[test]
    fn remove_refuses_non_trailing_command() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        {
            let mut file = File::open(&path)?;
            file.add_empty_code_signing_cmd()?;
        }

        // Append an LC_UUID after the signing command.
        let mut data = std::fs::read(&path)?;
        let uuid_offset = 32 + 144 + 16;
        let mut uuid = vec![];
        uuid.iowrite_with(0x1bu32, scroll::LE)?;
        uuid.iowrite_with(24u32, scroll::LE)?;
        uuid.extend_from_slice(&[0x42; 16]);
        data[uuid_offset..uuid_offset + 24].copy_from_slice(&uuid);
        data[16..20].copy_from_slice(&4u32.to_le_bytes());
        data[20..24].copy_from_slice(&(144u32 + 16 + 24).to_le_bytes());
        std::fs::write(&path, &data)?;

        let before = file_digest(&path);

        let mut file = File::open(&path)?;
        assert!(file.has_code_signing_cmd());
        assert!(!file.is_signing_command_last_loader());
        assert!(matches!(
            file.remove_signing_content(),
            Err(MachOSignatureError::CodeSigningCommandNotLast)
        ));
        assert_eq!(file_digest(&path), before);

        Ok(())
    }

    #[test]
    fn hash_pages_covers_data_offset() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        let mut file = File::open(&path)?;
        file.add_empty_code_signing_cmd()?;

        let mut hasher = sha2::Sha256::new();
        let hashes = file.hash_pages(&mut hasher)?;
        assert_eq!(hashes.len(), 1);

        let data = std::fs::read(&path)?;
        assert_eq!(hashes[0], sha2::Sha256::digest(&data[0..TEXT_SIZE]).to_vec());

        Ok(())
    }

    #[test]
    fn end_to_end_code_directory() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        let mut file = File::open(&path)?;
        file.add_empty_code_signing_cmd()?;

        let mut hasher = sha2::Sha256::new();
        let hashes = file.hash_pages(&mut hasher)?;
        let (command, _) = file.code_signing_cmd().unwrap();

        let mut builder = CodeDirectoryBuilder::new("com.example.bin", DigestType::Sha256, hashes);
        builder.set_code_limit(command.dataoff as u64);
        let cd = builder.build()?;

        let mut sb = SuperBlobBuilder::default();
        sb.add(CodeSigningSlot::CodeDirectory, Some(cd.to_blob()?));
        let sb = sb.finalize(0);
        let sb_data = sb.to_bytes()?;

        file.update_code_signing_cmd_data_size(sb.length())?;
        file.patch(&sb_data, sb_data.len(), command.dataoff as u64)?;

        let cd_data = file.cd_bytes(scroll::LE, 0)?;
        assert_eq!(cd_data, cd.to_blob()?.to_bytes()?);
        assert_eq!(file.cd_bytes(scroll::BE, 0)?, cd_data);

        let parsed = CodeDirectory::from_blob_bytes(&cd_data)?;
        assert_eq!(parsed.header(), cd.header());
        assert_eq!(parsed.ident(), "com.example.bin");
        assert_eq!(parsed.header().code_limit, TEXT_SIZE as u32);

        assert!(matches!(
            file.cd_bytes(scroll::LE, 1),
            Err(MachOSignatureError::NoCodeDirectory)
        ));
        assert!(matches!(
            file.cms_blob_bytes(scroll::LE),
            Err(MachOSignatureError::NoCmsSignature)
        ));

        let mut hasher = sha2::Sha256::new();
        assert_eq!(
            file.hash_cd(&mut hasher)?,
            sha2::Sha256::digest(&cd_data).to_vec()
        );

        Ok(())
    }

    #[test]
    fn cms_blob_bytes() -> Result<(), MachOSignatureError> {
        let dir = tempfile::tempdir()?;
        let path = write_temp_macho(&dir, "bin", &unsigned_macho(true));

        let mut file = File::open(&path)?;
        file.add_empty_code_signing_cmd()?;
        let (command, _) = file.code_signing_cmd().unwrap();

        let cms = Blob::blob_wrapper(vec![0x30, 0x80, 0, 0]);
        let mut sb = SuperBlobBuilder::default();
        sb.add(
            CodeSigningSlot::CodeDirectory,
            Some(Blob::new(CodeSigningMagic::CodeDirectory, vec![0; 8])),
        )
        .add(
            CodeSigningSlot::AlternateCodeDirectory0,
            Some(Blob::new(CodeSigningMagic::CodeDirectory, vec![1; 8])),
        )
        .add(CodeSigningSlot::Signature, Some(cms.clone()));
        let sb = sb.finalize(0);
        let sb_data = sb.to_bytes()?;

        file.patch(&sb_data, sb_data.len(), command.dataoff as u64)?;
        file.update_code_signing_cmd_data_size(sb.length())?;

        assert_eq!(file.superblob()?, sb);
        assert_eq!(file.cms_blob_bytes(scroll::BE)?, cms.to_bytes()?);
        assert_eq!(&file.cd_bytes(scroll::LE, 1)?[8..], &[1; 8]);

        Ok(())
    }
}
