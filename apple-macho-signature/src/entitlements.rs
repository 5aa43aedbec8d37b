// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functionality related to entitlements.

use {
    crate::{code_directory::ExecutableSegmentFlags, error::MachOSignatureError},
    plist::Value,
};

/// Entitlements that imply executable segment flags when set to `true`.
const IMPLIED_FLAGS: &[(&str, ExecutableSegmentFlags)] = &[
    ("get-task-allow", ExecutableSegmentFlags::ALLOW_UNSIGNED),
    ("run-unsigned-code", ExecutableSegmentFlags::ALLOW_UNSIGNED),
    (
        "com.apple.private.cs.debugger",
        ExecutableSegmentFlags::DEBUGGER,
    ),
    ("dynamic-codesigning", ExecutableSegmentFlags::JIT),
    (
        "com.apple.private.skip-library-validation",
        ExecutableSegmentFlags::SKIP_LIBRARY_VALIDATION,
    ),
    (
        "com.apple.private.amfi.can-load-cdhash",
        ExecutableSegmentFlags::CAN_LOAD_CD_HASH,
    ),
    (
        "com.apple.private.amfi.can-execute-cdhash",
        ExecutableSegmentFlags::CAN_EXEC_CD_HASH,
    ),
];

/// Parse an entitlements plist XML document.
pub fn parse_entitlements_xml(xml: &str) -> Result<Value, MachOSignatureError> {
    Value::from_reader_xml(xml.as_bytes()).map_err(MachOSignatureError::EntitlementsPlist)
}

/// Convert an entitlements plist to [ExecutableSegmentFlags].
///
/// Some entitlements plist values imply features in executable segment flags.
/// This function resolves those implied features.
pub fn plist_to_executable_segment_flags(value: &Value) -> ExecutableSegmentFlags {
    let mut flags = ExecutableSegmentFlags::empty();

    if let Value::Dictionary(d) = value {
        for (key, flag) in IMPLIED_FLAGS {
            if matches!(d.get(*key), Some(Value::Boolean(true))) {
                flags |= *flag;
            }
        }
    }

    flags
}
