// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Apple code signature data structures and in-place Mach-O signing.
//!
//! Apple code signatures live in a *superblob* at the end of the
//! `__LINKEDIT` segment of a Mach-O binary, referenced by the
//! `LC_CODE_SIGNATURE` load command. This crate models that data and edits
//! binaries on disk to embed it.
//!
//! # Features and Capabilities
//!
//! * Parse and serialize the big-endian blob structures: [Blob],
//!   [SuperBlob], [CodeDirectory] (all versions from `0x20001` to
//!   `0x20500`) and [Requirements].
//! * Compute per-page code digests ([paged_digests]).
//! * Patch a thin Mach-O binary in place ([File]): add, resize and remove
//!   the code signing load command and write signature data.
//! * Produce ad-hoc signatures or signatures carrying a CMS blob from an
//!   external [CmsSigner] ([sign_file]). Universal binaries are signed one
//!   architecture at a time and reassembled ([create_universal_macho]).
//!
//! # Non-features
//!
//! [File] patches thin binaries only. Compiling code requirement
//! expressions and producing CMS signatures are left to other crates.
//!
//! # Byte Order
//!
//! Code signing structures are always big-endian, regardless of the byte
//! order of the Mach-O binary holding them.

mod code_directory;
pub use code_directory::*;
mod code_hash;
pub use code_hash::*;
mod embedded_signature;
pub use embedded_signature::*;
pub mod entitlements;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
mod requirements;
pub use requirements::*;
mod signing;
pub use signing::*;
mod signing_settings;
pub use signing_settings::*;
mod superblob;
pub use superblob::*;
mod universal;
pub use universal::*;
