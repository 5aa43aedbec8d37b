// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing settings.

use {
    crate::{
        code_directory::{CodeSignatureFlags, ExecutableSegmentFlags},
        embedded_signature::{DigestType, MAX_ALTERNATE_CODE_DIRECTORIES},
        entitlements::parse_entitlements_xml,
        error::MachOSignatureError,
    },
    log::info,
};

/// Represents code signing settings.
///
/// This type holds settings related to a single logical signing operation on a
/// single Mach-O binary.
#[derive(Clone, Debug, Default)]
pub struct SigningSettings {
    binary_identifier: Option<String>,
    team_id: Option<String>,
    digest_type: DigestType,
    extra_digests: Vec<DigestType>,
    code_signature_flags: CodeSignatureFlags,
    executable_segment_flags: Option<ExecutableSegmentFlags>,
    code_directory_version: Option<u32>,
    runtime_version: Option<semver::Version>,
    entitlements: Option<(String, plist::Value)>,
    entitlements_der: Option<Vec<u8>>,
    designated_requirement: Option<Vec<u8>>,
}

impl SigningSettings {
    /// The identifier recorded in the code directory.
    pub fn binary_identifier(&self) -> Option<&str> {
        self.binary_identifier.as_deref()
    }

    /// Set the binary identifier (e.g. `com.example.tool`).
    ///
    /// Signing fails without one.
    pub fn set_binary_identifier(&mut self, value: impl ToString) {
        self.binary_identifier = Some(value.to_string());
    }

    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    pub fn set_team_id(&mut self, value: impl ToString) {
        self.team_id = Some(value.to_string());
    }

    /// The digest type of the primary code directory.
    pub fn digest_type(&self) -> &DigestType {
        &self.digest_type
    }

    pub fn set_digest_type(&mut self, digest_type: DigestType) {
        self.digest_type = digest_type;
    }

    /// Digest types of alternate code directories.
    pub fn extra_digests(&self) -> &[DigestType] {
        &self.extra_digests
    }

    /// Request an alternate code directory using another digest type.
    ///
    /// Duplicates of the primary or an existing extra digest are ignored.
    pub fn add_extra_digest(&mut self, digest_type: DigestType) -> Result<(), MachOSignatureError> {
        if digest_type == self.digest_type || self.extra_digests.contains(&digest_type) {
            return Ok(());
        }

        if self.extra_digests.len() >= MAX_ALTERNATE_CODE_DIRECTORIES {
            return Err(MachOSignatureError::AlternateCodeDirectoryLimit(
                self.extra_digests.len(),
            ));
        }

        self.extra_digests.push(digest_type);

        Ok(())
    }

    /// All digest types, primary first.
    pub fn all_digests(&self) -> Vec<DigestType> {
        std::iter::once(self.digest_type)
            .chain(self.extra_digests.iter().copied())
            .collect()
    }

    pub fn code_signature_flags(&self) -> CodeSignatureFlags {
        self.code_signature_flags
    }

    pub fn set_code_signature_flags(&mut self, flags: CodeSignatureFlags) {
        info!("using code signature flags: {:?}", flags);
        self.code_signature_flags = flags;
    }

    pub fn add_code_signature_flags(&mut self, flags: CodeSignatureFlags) {
        self.code_signature_flags |= flags;
    }

    pub fn remove_code_signature_flags(&mut self, flags: CodeSignatureFlags) {
        self.code_signature_flags -= flags;
    }

    /// Explicit executable segment flags.
    ///
    /// Flags implied by the binary type and entitlements are added at signing time.
    pub fn executable_segment_flags(&self) -> Option<ExecutableSegmentFlags> {
        self.executable_segment_flags
    }

    pub fn set_executable_segment_flags(&mut self, flags: ExecutableSegmentFlags) {
        self.executable_segment_flags = Some(flags);
    }

    /// Force a specific code directory version.
    pub fn code_directory_version(&self) -> Option<u32> {
        self.code_directory_version
    }

    pub fn set_code_directory_version(&mut self, version: u32) {
        self.code_directory_version = Some(version);
    }

    /// The hardened runtime version to record.
    pub fn runtime_version(&self) -> Option<&semver::Version> {
        self.runtime_version.as_ref()
    }

    pub fn set_runtime_version(&mut self, version: semver::Version) {
        self.runtime_version = Some(version);
    }

    /// The entitlements plist XML.
    pub fn entitlements_xml(&self) -> Option<&str> {
        self.entitlements.as_ref().map(|(xml, _)| xml.as_str())
    }

    /// The parsed entitlements plist.
    pub fn entitlements_plist(&self) -> Option<&plist::Value> {
        self.entitlements.as_ref().map(|(_, value)| value)
    }

    /// Set entitlements from a plist XML document.
    ///
    /// The document must parse as a plist.
    pub fn set_entitlements_xml(&mut self, xml: impl ToString) -> Result<(), MachOSignatureError> {
        let xml = xml.to_string();
        let value = parse_entitlements_xml(&xml)?;

        self.entitlements = Some((xml, value));

        Ok(())
    }

    /// DER encoded entitlements.
    pub fn entitlements_der(&self) -> Option<&[u8]> {
        self.entitlements_der.as_deref()
    }

    pub fn set_entitlements_der(&mut self, der: Vec<u8>) {
        self.entitlements_der = Some(der);
    }

    /// Compiled designated requirement expression.
    pub fn designated_requirement(&self) -> Option<&[u8]> {
        self.designated_requirement.as_deref()
    }

    /// Set the designated requirement from already compiled expression bytes.
    pub fn set_designated_requirement_bytes(&mut self, expression: impl Into<Vec<u8>>) {
        self.designated_requirement = Some(expression.into());
    }
}
