// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Functionality related to hashing code.

The Mach-O signature data contains cryptographic hashes of the content of
the binary being signed. The signed range of the file is split into pages
of [PAGE_SIZE] bytes and each page is hashed independently. When a page is
loaded, the kernel verifies its hash against the code directory.

The final page is hashed over only the bytes that remain. It is not padded.
*/

use digest::DynDigest;

/// log2 of the code signing page size.
pub const PAGE_SIZE_BITS: u8 = 12;

/// Code signing page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;

/// Compute paged hashes.
///
/// `data` is split into chunks of `page_size` and each chunk is hashed with
/// `hasher`, which is reset between pages.
pub fn paged_digests(data: &[u8], hasher: &mut dyn DynDigest, page_size: usize) -> Vec<Vec<u8>> {
    hasher.reset();

    data.chunks(page_size)
        .map(|chunk| {
            hasher.update(chunk);
            hasher.finalize_reset().to_vec()
        })
        .collect::<Vec<_>>()
}
