// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Unified error type for Mach-O signature embedding.
#[derive(Debug, Error)]
pub enum MachOSignatureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("invalid Mach-O binary: {0}")]
    InvalidBinary(String),

    #[error("universal Mach-O binaries must be patched one architecture at a time")]
    UnsupportedUniversalBinary,

    #[error("unable to locate __TEXT segment")]
    MissingText,

    #[error("unable to locate __LINKEDIT segment")]
    MissingLinkedit,

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("code directory data is malformed: {0}")]
    CodeDirectoryMalformed(&'static str),

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("code directory field {0} requires version {1:#x} or newer")]
    CodeDirectoryFieldRequiresVersion(&'static str, u32),

    #[error("requirements blob is malformed")]
    RequirementsMalformed,

    #[error("unable to find code directory")]
    NoCodeDirectory,

    #[error("unable to find CMS blob")]
    NoCmsSignature,

    #[error("at most 5 alternate code directories are allowed (requested #{0})")]
    AlternateCodeDirectoryLimit(usize),

    #[error("loader command already exists, cannot add another")]
    CodeSigningCommandExists,

    #[error("LC_CODE_SIGNATURE is not present")]
    NoCodeSigningCommand,

    #[error("no room for a new loader command")]
    LoadCommandNoRoom,

    #[error("code signing command is not the last loader command; refusing to remove it")]
    CodeSigningCommandNotLast,

    #[error("patch of {size} bytes exceeds the {available} bytes provided")]
    PatchOutOfBounds { size: usize, available: usize },

    #[error("writes not allowed on a read-only Mach-O file")]
    ReadOnly,

    #[error("signature data grew beyond its reserved size ({0} > {1} bytes)")]
    SignatureDataTooLarge(usize, usize),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("no identifier string provided")]
    NoIdentifier,

    #[error("error parsing entitlements plist: {0}")]
    EntitlementsPlist(plist::Error),

    #[error("unknown code signature flag: {0}")]
    CodeSignatureUnknownFlag(String),

    #[error("unknown executable segment flag: {0}")]
    ExecutableSegmentUnknownFlag(String),

    #[error("CMS signature generation failed: {0}")]
    CmsSigner(String),
}
