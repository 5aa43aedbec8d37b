// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Superblob container and builder.
//!
//! A superblob is the top-level container of embedded signature data:
//!
//! ```text
//! [magic: u32][length: u32][count: u32]
//! count * [slot: u32][offset: u32]
//! blob data
//! zero padding
//! ```
//!
//! `length` covers everything, padding included. Index offsets are relative
//! to the start of the superblob.
//!
//! Superblobs are assembled with [SuperBlobBuilder], which is consumed by
//! [SuperBlobBuilder::finalize] so offsets can never go stale.

use {
    crate::{
        code_hash::PAGE_SIZE,
        embedded_signature::{
            Blob, BlobIndex, CodeSigningMagic, CodeSigningSlot, BLOB_INDEX_SIZE,
            SIGNING_ORDER,
        },
        error::MachOSignatureError,
    },
    log::trace,
    scroll::{IOwrite, Pread},
    std::io::Write,
};

/// Size of the superblob header (magic + length + count).
pub const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Padding reserved when no padding target is given.
///
/// A later signing pass may grow the CMS blob (e.g. with a timestamp). The
/// reserved pages absorb that growth so the declared length never increases.
pub const DEFAULT_PADDING: usize = 4 * PAGE_SIZE;

/// A finalized superblob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperBlob {
    magic: CodeSigningMagic,
    length: u32,
    index: Vec<BlobIndex>,
    blobs: Vec<Blob>,
    padding: usize,
}

impl SuperBlob {
    pub fn magic(&self) -> CodeSigningMagic {
        self.magic
    }

    /// Total serialized length, padding included.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn count(&self) -> u32 {
        self.index.len() as u32
    }

    pub fn index(&self) -> &[BlobIndex] {
        &self.index
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    /// Number of trailing zero bytes.
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Iterate over `(index entry, blob)` pairs in index order.
    pub fn entries(&self) -> impl Iterator<Item = (&BlobIndex, &Blob)> {
        self.index.iter().zip(self.blobs.iter())
    }

    /// Find the blob in a slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&Blob> {
        self.entries()
            .find(|(index, _)| index.slot == slot)
            .map(|(_, blob)| blob)
    }

    /// Iterate over blobs in code directory slots (primary and alternates), in index order.
    pub fn code_directories(&self) -> impl Iterator<Item = &Blob> {
        self.entries()
            .filter(|(index, _)| index.slot.is_code_directory())
            .map(|(_, blob)| blob)
    }

    /// Obtain the `nth` code directory blob.
    pub fn nth_code_directory(&self, nth: usize) -> Result<&Blob, MachOSignatureError> {
        self.code_directories()
            .nth(nth)
            .ok_or(MachOSignatureError::NoCodeDirectory)
    }

    /// Obtain the CMS signature blob.
    pub fn cms_signature(&self) -> Result<&Blob, MachOSignatureError> {
        self.find_slot(CodeSigningSlot::Signature)
            .ok_or(MachOSignatureError::NoCmsSignature)
    }

    /// Serialize to bytes.
    ///
    /// Output length always equals [SuperBlob::length].
    pub fn to_bytes(&self) -> Result<Vec<u8>, MachOSignatureError> {
        let mut res = Vec::with_capacity(self.length as usize);

        res.iowrite_with(u32::from(self.magic), SIGNING_ORDER)?;
        res.iowrite_with(self.length, SIGNING_ORDER)?;
        res.iowrite_with(self.count(), SIGNING_ORDER)?;

        for index in &self.index {
            index.write_to(&mut res)?;
        }

        for (index, blob) in self.entries() {
            let offset = index.offset as usize;
            if res.len() > offset {
                return Err(MachOSignatureError::SuperblobMalformed);
            }
            res.resize(offset, 0);
            blob.write_to(&mut res)?;
        }

        if res.len() + self.padding != self.length as usize {
            return Err(MachOSignatureError::SuperblobMalformed);
        }
        res.write_all(&vec![0u8; self.padding])?;

        Ok(res)
    }

    /// Parse a superblob from bytes.
    ///
    /// Blobs must appear in index order and not overlap. Bytes after the
    /// last blob up to the declared length are treated as padding. Bytes
    /// past the declared length are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MachOSignatureError> {
        let offset = &mut 0;

        let magic = CodeSigningMagic::from(data.gread_with::<u32>(offset, SIGNING_ORDER)?);
        let length = data.gread_with::<u32>(offset, SIGNING_ORDER)?;
        let count = data.gread_with::<u32>(offset, SIGNING_ORDER)?;

        let data = data
            .get(0..length as usize)
            .ok_or(MachOSignatureError::SuperblobMalformed)?;

        let index_end = (count as usize)
            .checked_mul(BLOB_INDEX_SIZE)
            .and_then(|size| size.checked_add(SUPERBLOB_HEADER_SIZE))
            .ok_or(MachOSignatureError::SuperblobMalformed)?;
        if index_end > data.len() {
            return Err(MachOSignatureError::SuperblobMalformed);
        }

        let mut index = Vec::with_capacity(count as usize);
        for _ in 0..count {
            index.push(BlobIndex::parse(&data[*offset..])?);
            *offset += BLOB_INDEX_SIZE;
        }

        let mut blobs = Vec::with_capacity(index.len());
        let mut cursor = index_end;

        for entry in &index {
            let start = entry.offset as usize;
            if start < cursor {
                return Err(MachOSignatureError::SuperblobMalformed);
            }

            let blob_data = data
                .get(start..)
                .ok_or(MachOSignatureError::SuperblobMalformed)?;
            let blob = Blob::parse(blob_data)?;

            cursor = start + blob.length() as usize;
            blobs.push(blob);
        }

        let padding = data.len() - cursor;

        trace!(
            "parsed superblob with {} blobs; length {}; padding {}",
            blobs.len(),
            length,
            padding
        );

        Ok(Self {
            magic,
            length,
            index,
            blobs,
            padding,
        })
    }
}

/// Assembles a [SuperBlob].
///
/// Blobs appear on the wire in the order they are added. Callers should add
/// slots in ascending slot order, as Apple's tooling does.
#[derive(Clone, Debug)]
pub struct SuperBlobBuilder {
    magic: CodeSigningMagic,
    length: u32,
    slots: Vec<CodeSigningSlot>,
    blobs: Vec<Blob>,
}

impl Default for SuperBlobBuilder {
    fn default() -> Self {
        Self::new(CodeSigningMagic::EmbeddedSignature)
    }
}

impl SuperBlobBuilder {
    pub fn new(magic: CodeSigningMagic) -> Self {
        Self {
            magic,
            length: SUPERBLOB_HEADER_SIZE as u32,
            slots: vec![],
            blobs: vec![],
        }
    }

    /// Add a blob in a slot.
    ///
    /// `None` is ignored.
    pub fn add(&mut self, slot: CodeSigningSlot, blob: Option<Blob>) -> &mut Self {
        if let Some(blob) = blob {
            self.length += blob.length() + BLOB_INDEX_SIZE as u32;
            self.slots.push(slot);
            self.blobs.push(blob);
        }

        self
    }

    /// Length of the superblob without padding.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Compute offsets and padding, producing the final superblob.
    ///
    /// A `padding_target` of 0 reserves [DEFAULT_PADDING] bytes of padding.
    /// Otherwise padding is sized so the total length equals
    /// `padding_target`. When the blobs alone exceed the target no padding
    /// is added and the total length exceeds the target; callers reserving
    /// space must check for this.
    pub fn finalize(self, padding_target: usize) -> SuperBlob {
        let mut cursor = SUPERBLOB_HEADER_SIZE + BLOB_INDEX_SIZE * self.blobs.len();

        let index = self
            .slots
            .iter()
            .zip(self.blobs.iter())
            .map(|(slot, blob)| {
                let entry = BlobIndex {
                    slot: *slot,
                    offset: cursor as u32,
                };
                cursor += blob.length() as usize;

                entry
            })
            .collect::<Vec<_>>();

        let padding = if padding_target == 0 {
            DEFAULT_PADDING
        } else {
            padding_target.saturating_sub(cursor)
        };

        trace!(
            "finalized superblob with {} blobs; content length {}; padding {}",
            index.len(),
            cursor,
            padding
        );

        SuperBlob {
            magic: self.magic,
            length: (cursor + padding) as u32,
            index,
            blobs: self.blobs,
            padding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_offsets(sb: &SuperBlob) {
        let mut expected = SUPERBLOB_HEADER_SIZE + sb.count() as usize * BLOB_INDEX_SIZE;

        for (index, blob) in sb.entries() {
            assert_eq!(index.offset as usize, expected);
            expected += blob.length() as usize;
        }

        assert_eq!(expected + sb.padding(), sb.length() as usize);
    }

    #[test]
    fn empty_superblob() -> Result<(), MachOSignatureError> {
        let sb = SuperBlobBuilder::default().finalize(0);

        assert_eq!(sb.count(), 0);
        assert_eq!(sb.padding(), DEFAULT_PADDING);
        assert_eq!(sb.length() as usize, 12 + DEFAULT_PADDING);

        let data = sb.to_bytes()?;
        assert_eq!(data.len(), sb.length() as usize);
        assert_eq!(&data[0..4], &[0xfa, 0xde, 0x0c, 0xc0]);
        assert_eq!(SuperBlob::from_bytes(&data)?, sb);

        Ok(())
    }

    #[test]
    fn single_blob_roundtrip() -> Result<(), MachOSignatureError> {
        let mut builder = SuperBlobBuilder::default();
        builder.add(
            CodeSigningSlot::CodeDirectory,
            Some(Blob::new(CodeSigningMagic::CodeDirectory, vec![1; 40])),
        );
        assert_eq!(builder.length(), 12 + 48 + 8);

        let sb = builder.finalize(0);
        assert_offsets(&sb);
        assert_eq!(sb.index()[0].offset, 20);

        let parsed = SuperBlob::from_bytes(&sb.to_bytes()?)?;
        assert_eq!(parsed, sb);
        assert_eq!(parsed.nth_code_directory(0)?.payload(), &[1; 40]);
        assert!(matches!(
            parsed.nth_code_directory(1),
            Err(MachOSignatureError::NoCodeDirectory)
        ));
        assert!(matches!(
            parsed.cms_signature(),
            Err(MachOSignatureError::NoCmsSignature)
        ));

        Ok(())
    }

    #[test]
    fn multiple_blobs_roundtrip() -> Result<(), MachOSignatureError> {
        let mut builder = SuperBlobBuilder::default();
        builder
            .add(
                CodeSigningSlot::CodeDirectory,
                Some(Blob::new(CodeSigningMagic::CodeDirectory, vec![1; 13])),
            )
            .add(
                CodeSigningSlot::RequirementSet,
                Some(Blob::new(CodeSigningMagic::RequirementSet, vec![0; 4])),
            )
            .add(CodeSigningSlot::Entitlements, None)
            .add(
                CodeSigningSlot::AlternateCodeDirectory0,
                Some(Blob::new(CodeSigningMagic::CodeDirectory, vec![2; 7])),
            )
            .add(
                CodeSigningSlot::Signature,
                Some(Blob::blob_wrapper(vec![])),
            );

        let sb = builder.finalize(0);
        assert_eq!(sb.count(), 4);
        assert_offsets(&sb);

        let parsed = SuperBlob::from_bytes(&sb.to_bytes()?)?;
        assert_eq!(parsed, sb);
        assert_eq!(parsed.code_directories().count(), 2);
        assert_eq!(parsed.nth_code_directory(1)?.payload(), &[2; 7]);
        assert_eq!(parsed.cms_signature()?.length(), 8);
        assert!(parsed.find_slot(CodeSigningSlot::Entitlements).is_none());

        Ok(())
    }

    #[test]
    fn padding_target_fixes_length() {
        let blob = || Some(Blob::new(CodeSigningMagic::BlobWrapper, vec![0; 100]));

        let mut builder = SuperBlobBuilder::default();
        builder.add(CodeSigningSlot::Signature, blob());
        let first = builder.finalize(0);

        // A smaller second pass is padded out to the first pass's length.
        let mut builder = SuperBlobBuilder::default();
        builder.add(
            CodeSigningSlot::Signature,
            Some(Blob::new(CodeSigningMagic::BlobWrapper, vec![0; 60])),
        );
        let second = builder.finalize(first.length() as usize);
        assert_eq!(second.length(), first.length());
        assert_eq!(second.padding(), first.padding() + 40);
        assert_offsets(&second);

        // Content larger than the target gets no padding.
        let mut builder = SuperBlobBuilder::default();
        builder.add(CodeSigningSlot::Signature, blob());
        let third = builder.finalize(50);
        assert_eq!(third.padding(), 0);
        assert_eq!(third.length(), 12 + 8 + 108);
    }

    #[test]
    fn malformed_superblobs() -> Result<(), MachOSignatureError> {
        let mut builder = SuperBlobBuilder::default();
        builder.add(
            CodeSigningSlot::CodeDirectory,
            Some(Blob::new(CodeSigningMagic::CodeDirectory, vec![1; 16])),
        );
        let data = builder.finalize(0).to_bytes()?;

        // Truncated.
        assert!(SuperBlob::from_bytes(&data[0..30]).is_err());

        // Count larger than the data.
        let mut bad = data.clone();
        bad[8..12].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(SuperBlob::from_bytes(&bad).is_err());

        // Blob offset inside the index table.
        let mut bad = data;
        bad[16..20].copy_from_slice(&[0, 0, 0, 4]);
        assert!(matches!(
            SuperBlob::from_bytes(&bad),
            Err(MachOSignatureError::SuperblobMalformed)
        ));

        Ok(())
    }
}
