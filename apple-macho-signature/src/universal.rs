// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Universal (fat) Mach-O containers.
//!
//! A universal binary is a big-endian `fat_header` and one `fat_arch` record
//! per architecture, followed by the thin binaries at aligned offsets.

use {
    crate::error::MachOSignatureError,
    goblin::mach::{
        fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
        Mach, MachO,
    },
    log::debug,
    scroll::{IOwrite, Pwrite},
    std::io::Write,
};

/// log2 of the alignment of thin binaries within a universal binary.
///
/// x86-64 uses 4k pages and aarch64 16k. 16k satisfies both.
const ALIGN_BITS: u32 = 14;

/// Obtain the thin binaries inside a universal binary.
///
/// Returns `None` if `data` is a thin binary.
pub fn universal_members(data: &[u8]) -> Result<Option<Vec<&[u8]>>, MachOSignatureError> {
    let multiarch = match Mach::parse(data)? {
        Mach::Binary(_) => return Ok(None),
        Mach::Fat(multiarch) => multiarch,
    };

    let mut res = Vec::with_capacity(multiarch.narches);

    for arch in multiarch.iter_arches() {
        let arch = arch?;

        let start = arch.offset as usize;
        let member = start
            .checked_add(arch.size as usize)
            .and_then(|end| data.get(start..end))
            .ok_or_else(|| {
                MachOSignatureError::InvalidBinary(format!(
                    "universal binary member at {:#x} exceeds file size",
                    start
                ))
            })?;

        res.push(member);
    }

    debug!("universal binary holds {} architectures", res.len());

    Ok(Some(res))
}

/// Create a universal Mach-O binary from thin Mach-O binaries.
///
/// Every binary must parse as thin Mach-O. Members keep the order given.
pub fn create_universal_macho<'a>(
    writer: &mut impl Write,
    binaries: impl Iterator<Item = &'a [u8]>,
) -> Result<(), MachOSignatureError> {
    let align = 1u32 << ALIGN_BITS;
    let too_large = || MachOSignatureError::InvalidBinary("universal binary exceeds 4 GB".into());

    let mut records = vec![];
    let mut offset = align;

    for binary in binaries {
        let macho = MachO::parse(binary, 0)?;

        let pad_bytes = match offset % align {
            0 => 0,
            x => align - x,
        };
        offset = offset.checked_add(pad_bytes).ok_or_else(too_large)?;

        let arch = FatArch {
            cputype: macho.header.cputype,
            cpusubtype: macho.header.cpusubtype,
            offset,
            size: u32::try_from(binary.len()).map_err(|_| too_large())?,
            align: ALIGN_BITS,
        };

        offset = offset.checked_add(arch.size).ok_or_else(too_large)?;

        records.push((arch, pad_bytes as usize, binary));
    }

    let header_size = SIZEOF_FAT_HEADER + records.len() * SIZEOF_FAT_ARCH;
    if header_size > align as usize {
        return Err(MachOSignatureError::InvalidBinary(format!(
            "too many architectures for a universal binary: {}",
            records.len()
        )));
    }

    writer.iowrite_with(FAT_MAGIC, scroll::BE)?;
    writer.iowrite_with(records.len() as u32, scroll::BE)?;

    for (arch, _, _) in &records {
        let mut buffer = [0u8; SIZEOF_FAT_ARCH];
        buffer.pwrite_with(arch, 0, scroll::BE)?;
        writer.write_all(&buffer)?;
    }

    writer.write_all(&b"\0".repeat(align as usize - header_size))?;

    for (_, pad_bytes, binary) in records {
        writer.write_all(&b"\0".repeat(pad_bytes))?;
        writer.write_all(binary)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::macho::tests::unsigned_macho};

    #[test]
    fn thin_binary_has_no_members() -> Result<(), MachOSignatureError> {
        assert!(universal_members(&unsigned_macho(true))?.is_none());

        Ok(())
    }

    #[test]
    fn create_and_split() -> Result<(), MachOSignatureError> {
        let thin64 = unsigned_macho(true);
        let thin32 = unsigned_macho(false);

        let mut data = vec![];
        create_universal_macho(
            &mut data,
            [thin64.as_slice(), thin32.as_slice()].into_iter(),
        )?;

        assert_eq!(&data[0..8], &[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 2]);
        // First member at 16k, second at the next 16k boundary.
        assert_eq!(&data[16..20], &[0, 0, 0x40, 0]);
        assert_eq!(&data[36..40], &[0, 0, 0x80, 0]);
        assert_eq!(data.len(), 0x8000 + thin32.len());

        let members = universal_members(&data)?.unwrap();
        assert_eq!(members, vec![thin64.as_slice(), thin32.as_slice()]);

        Ok(())
    }

    #[test]
    fn member_out_of_bounds() -> Result<(), MachOSignatureError> {
        let thin = unsigned_macho(true);

        let mut data = vec![];
        create_universal_macho(&mut data, [thin.as_slice()].into_iter())?;
        data.truncate(data.len() - 1);

        assert!(universal_members(&data).is_err());

        Ok(())
    }
}
