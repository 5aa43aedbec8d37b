// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing Mach-O binaries in place.

Signing has a circular dependency: the code directory digests every page of
the binary up to the signature data, but adding the signature changes the
Mach-O header (load command data size, `__LINKEDIT` segment sizes) which is
itself digested. We break the cycle with two passes:

1. Build a superblob with generous padding and write it to disk so the
   space is reserved. Record its size in the load commands.
2. Re-digest the now final header and rebuild the superblob, padded to
   exactly the reserved size.

The second superblob can only be larger than the first if the CMS signature
grew by more than the padding, which is an error.
*/

use {
    crate::{
        code_directory::{
            CodeDirectory, CodeDirectoryBuilder, CodeDirectoryVersion, CodeSignatureFlags,
            ExecutableSegmentFlags,
        },
        code_hash::PAGE_SIZE_BITS,
        embedded_signature::{Blob, CodeSigningSlot, DigestType},
        entitlements::plist_to_executable_segment_flags,
        error::MachOSignatureError,
        macho::{parse_version_nibbles, semver_to_macho_target_version, File},
        requirements::Requirements,
        signing_settings::SigningSettings,
        superblob::{SuperBlob, SuperBlobBuilder},
        universal::{create_universal_macho, universal_members},
    },
    goblin::mach::constants::SEG_LINKEDIT,
    log::{debug, info, warn},
    std::path::Path,
};

/// Alignment of `__LINKEDIT` virtual memory size.
const SEGMENT_ALIGNMENT: u64 = 16384;

fn align_segment_size(size: u64) -> u64 {
    (size + SEGMENT_ALIGNMENT - 1) / SEGMENT_ALIGNMENT * SEGMENT_ALIGNMENT
}

/// Produces a CMS signature over a code directory.
///
/// Implementations typically wrap a certificate and private key. They
/// receive the bytes of the primary code directory blob and return DER
/// encoded CMS `SignedData`.
pub trait CmsSigner {
    fn sign_code_directory(&self, code_directory: &[u8])
        -> Result<Vec<u8>, MachOSignatureError>;
}

/// Signs a single Mach-O binary on disk.
pub struct MachOSigner<'a> {
    settings: &'a SigningSettings,
    cms_signer: Option<&'a dyn CmsSigner>,
}

impl<'a> MachOSigner<'a> {
    /// Construct a signer.
    ///
    /// Without a `cms_signer`, an ad-hoc signature is produced.
    pub fn new(settings: &'a SigningSettings, cms_signer: Option<&'a dyn CmsSigner>) -> Self {
        Self {
            settings,
            cms_signer,
        }
    }

    /// Sign the Mach-O binary at `path`, replacing any existing signature.
    ///
    /// Each architecture of a universal binary is signed independently and
    /// the universal binary is then reassembled.
    pub fn sign_file(&self, path: impl AsRef<Path>) -> Result<(), MachOSignatureError> {
        let path = path.as_ref();

        if self.settings.binary_identifier().is_none() {
            return Err(MachOSignatureError::NoIdentifier);
        }

        // Refuse digests we can't page hash before anything is written.
        for digest_type in self.settings.all_digests() {
            digest_type.new_resettable_hasher()?;
        }

        let data = std::fs::read(path)?;
        match universal_members(&data)? {
            Some(members) => self.sign_universal_file(path, &members),
            None => self.sign_thin_file(path),
        }
    }

    fn sign_universal_file(
        &self,
        path: &Path,
        members: &[&[u8]],
    ) -> Result<(), MachOSignatureError> {
        info!(
            "signing universal Mach-O binary at {} ({} architectures)",
            path.display(),
            members.len()
        );

        let temp_dir = tempfile::Builder::new()
            .prefix("apple-macho-signature-")
            .tempdir()?;

        let mut signed = Vec::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            let member_path = temp_dir.path().join(format!("arch{}", i));
            std::fs::write(&member_path, member)?;

            info!("signing architecture #{}", i);
            self.sign_thin_file(&member_path)?;
            signed.push(std::fs::read(&member_path)?);
        }

        let mut data = vec![];
        create_universal_macho(&mut data, signed.iter().map(|x| x.as_slice()))?;

        info!("writing universal Mach-O binary to {}", path.display());
        std::fs::write(path, data)?;

        Ok(())
    }

    fn sign_thin_file(&self, path: &Path) -> Result<(), MachOSignatureError> {
        info!("signing Mach-O binary at {}", path.display());
        let mut file = File::open(path)?;

        if file.has_code_signing_cmd() {
            info!("removing existing signature");
            Self::strip_signature(&mut file)?;
        }

        if self.cms_signer.is_none() {
            warn!("no CMS signer provided; binary will be ad-hoc signed");
        }

        file.add_empty_code_signing_cmd()?;
        let (command, _) = file
            .code_signing_cmd()
            .ok_or(MachOSignatureError::NoCodeSigningCommand)?;
        let data_offset = command.dataoff as u64;

        let reserved = self.create_superblob(&file, 0)?;
        let reserved_size = reserved.length();
        info!("reserving {} bytes for signature data", reserved_size);

        // The segment sizes can only grow once the file holds the data they cover.
        let data = reserved.to_bytes()?;
        file.patch(&data, data.len(), data_offset)?;
        file.update_code_signing_cmd_data_size(reserved_size)?;

        let linkedit = file.linkedit_segment()?.clone();
        let filesize = data_offset + reserved_size as u64 - linkedit.fileoff();
        file.update_segment_sizes(SEG_LINKEDIT, filesize, align_segment_size(filesize))?;

        let superblob = self.create_superblob(&file, reserved_size as usize)?;
        if superblob.length() > reserved_size {
            return Err(MachOSignatureError::SignatureDataTooLarge(
                superblob.length() as usize,
                reserved_size as usize,
            ));
        }

        info!("total signature size: {} bytes", superblob.length());
        info!(
            "code directory hash: {}",
            hex::encode(
                superblob
                    .nth_code_directory(0)?
                    .digest_with(*self.settings.digest_type())?
            )
        );
        let data = superblob.to_bytes()?;
        file.patch(&data, data.len(), data_offset)
    }

    /// Remove a signature and the space it occupied.
    ///
    /// When the signature data ended `__LINKEDIT`, the segment shrinks to
    /// end at the old data offset. The file is truncated there too if
    /// nothing followed the segment.
    fn strip_signature(file: &mut File) -> Result<(), MachOSignatureError> {
        let (command, _) = file
            .code_signing_cmd()
            .ok_or(MachOSignatureError::NoCodeSigningCommand)?;
        let linkedit = file.linkedit_segment()?.clone();

        let data_offset = command.dataoff as u64;
        let data_end = data_offset + command.datasize as u64;

        file.remove_signing_content()?;

        if linkedit.file_end() != data_end || data_offset < linkedit.fileoff() {
            debug!("signature data does not end __LINKEDIT; leaving segment as is");
            return Ok(());
        }

        let filesize = data_offset - linkedit.fileoff();
        file.update_segment_sizes(SEG_LINKEDIT, filesize, align_segment_size(filesize))?;

        if std::fs::metadata(file.path())?.len() == data_end {
            file.set_len(data_offset)?;
        }

        Ok(())
    }

    /// Create the superblob for the current state of `file`.
    ///
    /// `padding_target` is passed to [SuperBlobBuilder::finalize].
    pub fn create_superblob(
        &self,
        file: &File,
        padding_target: usize,
    ) -> Result<SuperBlob, MachOSignatureError> {
        let special_blobs = self.create_special_blobs()?;

        let code_directory =
            self.create_code_directory(file, *self.settings.digest_type(), &special_blobs)?;
        info!(
            "code directory version: {:#x}",
            code_directory.header().version
        );
        let code_directory = code_directory.to_blob()?;

        let mut alternates = vec![];
        for (i, digest_type) in self.settings.extra_digests().iter().enumerate() {
            info!(
                "adding alternative code directory using digest {}",
                digest_type
            );
            let slot = CodeSigningSlot::alternate_code_directory(i)?;
            let cd = self.create_code_directory(file, *digest_type, &special_blobs)?;

            alternates.push((slot, cd.to_blob()?));
        }

        let cms = match self.cms_signer {
            Some(signer) => {
                let signature = signer.sign_code_directory(&code_directory.to_bytes()?)?;
                debug!("CMS signature is {} bytes", signature.len());
                Blob::blob_wrapper(signature)
            }
            None => Blob::blob_wrapper(vec![]),
        };

        let mut builder = SuperBlobBuilder::default();
        builder.add(CodeSigningSlot::CodeDirectory, Some(code_directory));
        for (slot, blob) in special_blobs {
            builder.add(slot, Some(blob));
        }
        for (slot, blob) in alternates {
            builder.add(slot, Some(blob));
        }
        builder.add(CodeSigningSlot::Signature, Some(cms));

        Ok(builder.finalize(padding_target))
    }

    /// Create the blobs whose digests are recorded in code directory special slots.
    ///
    /// Blobs are returned in ascending slot order.
    pub fn create_special_blobs(
        &self,
    ) -> Result<Vec<(CodeSigningSlot, Blob)>, MachOSignatureError> {
        let mut res = vec![];

        let requirements = match self.settings.designated_requirement() {
            Some(expression) => {
                info!("using provided designated requirement");
                Requirements::designated(expression)?
            }
            None => Requirements::empty(),
        };
        res.push((CodeSigningSlot::RequirementSet, requirements.to_blob()?));

        if let Some(xml) = self.settings.entitlements_xml() {
            info!("adding entitlements XML");
            res.push((CodeSigningSlot::Entitlements, Blob::entitlements(xml)));
        }

        if let Some(der) = self.settings.entitlements_der() {
            info!("adding entitlements DER");
            res.push((
                CodeSigningSlot::EntitlementsDer,
                Blob::entitlements_der(der.to_vec()),
            ));
        }

        Ok(res)
    }

    /// Create a code directory using `digest_type`.
    pub fn create_code_directory(
        &self,
        file: &File,
        digest_type: DigestType,
        special_blobs: &[(CodeSigningSlot, Blob)],
    ) -> Result<CodeDirectory, MachOSignatureError> {
        let identifier = self
            .settings
            .binary_identifier()
            .ok_or(MachOSignatureError::NoIdentifier)?;

        let (command, _) = file
            .code_signing_cmd()
            .ok_or(MachOSignatureError::NoCodeSigningCommand)?;

        let mut flags = self.settings.code_signature_flags();

        // The adhoc flag is set when there is no CMS signature.
        if self.cms_signer.is_none() {
            flags |= CodeSignatureFlags::ADHOC;
        } else if flags.contains(CodeSignatureFlags::ADHOC) {
            info!("removing ad-hoc code signature flag");
            flags -= CodeSignatureFlags::ADHOC;
        }

        if flags.contains(CodeSignatureFlags::LINKER_SIGNED) {
            info!("removing linker signed flag from code signature");
            flags -= CodeSignatureFlags::LINKER_SIGNED;
        }

        let mut exec_seg_flags = self
            .settings
            .executable_segment_flags()
            .unwrap_or_else(ExecutableSegmentFlags::empty);

        if file.is_executable() {
            exec_seg_flags |= ExecutableSegmentFlags::MAIN_BINARY;
        }

        if let Some(entitlements) = self.settings.entitlements_plist() {
            let implied = plist_to_executable_segment_flags(entitlements);

            if !implied.is_empty() {
                info!("entitlements imply executable segment flags: {:?}", implied);
                exec_seg_flags |= implied;
            }
        }

        let runtime = match self.settings.runtime_version() {
            Some(version) => Some(semver_to_macho_target_version(version)),
            None if flags.contains(CodeSignatureFlags::RUNTIME) => match file.sdk_version() {
                Some(version) => {
                    info!(
                        "using hardened runtime version {} derived from SDK version",
                        parse_version_nibbles(version)
                    );
                    Some(version)
                }
                None => {
                    warn!("hardened runtime version required but unable to derive suitable version; signature will likely fail Apple checks");
                    None
                }
            },
            None => None,
        };

        let version = match self.settings.code_directory_version() {
            Some(version) => version,
            None if runtime.is_some() => CodeDirectoryVersion::SupportsRuntime as u32,
            None => CodeDirectoryVersion::SupportsExecutableSegment as u32,
        };

        let mut hasher = digest_type.new_resettable_hasher()?;
        let code_hashes = file
            .hash_pages(hasher.as_mut())?
            .into_iter()
            .map(|digest| digest_type.truncate(digest))
            .collect::<Vec<_>>();

        let text = file.text_segment()?;

        let mut builder = CodeDirectoryBuilder::new(identifier, digest_type, code_hashes);
        builder.set_version(version);
        builder.set_flags(flags);
        builder.set_page_size_log2(PAGE_SIZE_BITS);
        builder.set_code_limit(command.dataoff as u64);
        builder.set_executable_segment(text.fileoff(), text.filesize(), exec_seg_flags);

        if let Some(team_id) = self.settings.team_id() {
            builder.set_team_id(team_id);
        }
        if let Some(runtime) = runtime {
            builder.set_runtime(runtime);
        }

        for (slot, blob) in special_blobs {
            builder.set_special_hash(*slot, blob.digest_with(digest_type)?)?;
        }

        builder.build()
    }
}

/// Sign the Mach-O binary at `path` in place.
///
/// Produces an ad-hoc signature when `cms_signer` is `None`.
pub fn sign_file(
    path: impl AsRef<Path>,
    settings: &SigningSettings,
    cms_signer: Option<&dyn CmsSigner>,
) -> Result<(), MachOSignatureError> {
    MachOSigner::new(settings, cms_signer).sign_file(path)
}
