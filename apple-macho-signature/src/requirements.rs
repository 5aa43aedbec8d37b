// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Structural model of the internal requirements blob.

A requirements blob (magic `0xfade0c01`) begins with a u32 count followed by
`count` pairs of `(requirement type, offset)`. Offsets are relative to the
start of the requirements blob, header included. Each offset points at a
requirement blob (magic `0xfade0c00`) whose payload is a u32 expression form
(always 1) followed by compiled requirement expression opcodes.

Expressions are stored as opaque bytes. Compiling or interpreting them is the
job of another component.
*/

use {
    crate::{
        embedded_signature::{Blob, CodeSigningMagic, BLOB_HEADER_SIZE, SIGNING_ORDER},
        error::MachOSignatureError,
    },
    scroll::{IOwrite, Pread},
    std::io::Write,
};

/// Expression form word prefixed to compiled requirement expressions.
const EXPRESSION_FORM: u32 = 1;

/// The kind of a requirement within a requirements blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(v: RequirementType) -> Self {
        match v {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

/// An index entry within a requirements blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequirementIndex {
    pub requirement_type: RequirementType,
    /// Offset relative to the start of the requirements blob.
    pub offset: u32,
}

/// The internal requirements of a signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requirements {
    index: Vec<RequirementIndex>,
    payload: Vec<u8>,
}

impl Requirements {
    /// Requirements with no entries.
    ///
    /// This is what ad-hoc signatures carry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Requirements holding a single designated requirement.
    ///
    /// `expression` is an already compiled requirement expression, without
    /// the expression form word.
    pub fn designated(expression: &[u8]) -> Result<Self, MachOSignatureError> {
        let mut requirement = Vec::with_capacity(expression.len() + 4);
        requirement.iowrite_with(EXPRESSION_FORM, SIGNING_ORDER)?;
        requirement.write_all(expression)?;

        let blob = Blob::new(CodeSigningMagic::Requirement, requirement);

        Ok(Self {
            index: vec![RequirementIndex {
                requirement_type: RequirementType::Designated,
                // Blob header + count + 1 index entry.
                offset: (BLOB_HEADER_SIZE + 4 + 8) as u32,
            }],
            payload: blob.to_bytes()?,
        })
    }

    pub fn count(&self) -> u32 {
        self.index.len() as u32
    }

    pub fn index(&self) -> &[RequirementIndex] {
        &self.index
    }

    /// Bytes following the index.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Obtain the requirement blob for a requirement type.
    pub fn requirement(
        &self,
        requirement_type: RequirementType,
    ) -> Result<Option<Blob>, MachOSignatureError> {
        let entry = match self
            .index
            .iter()
            .find(|entry| entry.requirement_type == requirement_type)
        {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let start = (entry.offset as usize)
            .checked_sub(self.payload_start())
            .ok_or(MachOSignatureError::RequirementsMalformed)?;
        let data = self
            .payload
            .get(start..)
            .ok_or(MachOSignatureError::RequirementsMalformed)?;

        Ok(Some(Blob::parse_with_magic(
            data,
            CodeSigningMagic::Requirement,
            "requirement blob",
        )?))
    }

    /// Blob relative offset of the first payload byte.
    fn payload_start(&self) -> usize {
        BLOB_HEADER_SIZE + 4 + 8 * self.index.len()
    }

    /// Serialize the blob payload: count, index, then requirement data.
    pub fn serialize_payload(&self) -> Result<Vec<u8>, MachOSignatureError> {
        let mut res = Vec::with_capacity(4 + 8 * self.index.len() + self.payload.len());

        res.iowrite_with(self.count(), SIGNING_ORDER)?;
        for entry in &self.index {
            res.iowrite_with(u32::from(entry.requirement_type), SIGNING_ORDER)?;
            res.iowrite_with(entry.offset, SIGNING_ORDER)?;
        }
        res.write_all(&self.payload)?;

        Ok(res)
    }

    pub fn to_blob(&self) -> Result<Blob, MachOSignatureError> {
        Ok(Blob::new(
            CodeSigningMagic::RequirementSet,
            self.serialize_payload()?,
        ))
    }

    pub fn from_blob(blob: &Blob) -> Result<Self, MachOSignatureError> {
        if blob.magic() != CodeSigningMagic::RequirementSet {
            return Err(MachOSignatureError::BadMagic("requirements blob"));
        }

        let data = blob.payload();
        let offset = &mut 0;
        let count = data.gread_with::<u32>(offset, SIGNING_ORDER)?;

        let mut index = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let requirement_type = data.gread_with::<u32>(offset, SIGNING_ORDER)?;
            let entry_offset = data.gread_with::<u32>(offset, SIGNING_ORDER)?;

            if (entry_offset as usize) < BLOB_HEADER_SIZE + *offset
                || entry_offset as usize > blob.length() as usize
            {
                return Err(MachOSignatureError::RequirementsMalformed);
            }

            index.push(RequirementIndex {
                requirement_type: RequirementType::from(requirement_type),
                offset: entry_offset,
            });
        }

        let payload = data
            .get(*offset..)
            .ok_or(MachOSignatureError::RequirementsMalformed)?
            .to_vec();

        let res = Self { index, payload };

        if res.index.iter().any(|entry| (entry.offset as usize) < res.payload_start()) {
            return Err(MachOSignatureError::RequirementsMalformed);
        }

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_requirements() -> Result<(), MachOSignatureError> {
        let blob = Requirements::empty().to_blob()?;

        assert_eq!(blob.payload(), &[0, 0, 0, 0]);
        assert_eq!(
            blob.to_bytes()?,
            vec![0xfa, 0xde, 0x0c, 0x01, 0, 0, 0, 12, 0, 0, 0, 0]
        );
        assert_eq!(Requirements::from_blob(&blob)?, Requirements::empty());

        Ok(())
    }

    #[test]
    fn designated_requirement() -> Result<(), MachOSignatureError> {
        // `identifier "a"`: opIdent, length 1, "a" padded to 4 bytes.
        let expression = [0, 0, 0, 2, 0, 0, 0, 1, b'a', 0, 0, 0];
        let requirements = Requirements::designated(&expression)?;

        assert_eq!(requirements.count(), 1);
        assert_eq!(requirements.index()[0].offset, 20);

        let blob = requirements.to_blob()?;
        let data = blob.to_bytes()?;
        assert_eq!(&data[20..24], &[0xfa, 0xde, 0x0c, 0x00]);
        assert_eq!(blob.length() as usize, 20 + 8 + 4 + expression.len());

        let parsed = Requirements::from_blob(&blob)?;
        assert_eq!(parsed, requirements);

        let requirement = parsed
            .requirement(RequirementType::Designated)?
            .expect("designated requirement should be present");
        assert_eq!(&requirement.payload()[0..4], &[0, 0, 0, 1]);
        assert_eq!(&requirement.payload()[4..], &expression);
        assert!(parsed.requirement(RequirementType::Host)?.is_none());

        Ok(())
    }

    #[test]
    fn malformed_offsets() -> Result<(), MachOSignatureError> {
        let mut payload = vec![];
        payload.iowrite_with(1u32, SIGNING_ORDER)?;
        payload.iowrite_with(3u32, SIGNING_ORDER)?;
        payload.iowrite_with(1000u32, SIGNING_ORDER)?;

        let blob = Blob::new(CodeSigningMagic::RequirementSet, payload);
        assert!(matches!(
            Requirements::from_blob(&blob),
            Err(MachOSignatureError::RequirementsMalformed)
        ));

        // Count claims more entries than present.
        let blob = Blob::new(CodeSigningMagic::RequirementSet, vec![0, 0, 0, 2]);
        assert!(Requirements::from_blob(&blob).is_err());

        Ok(())
    }
}
