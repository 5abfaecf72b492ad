// BLOB version prefix helpers. [version: u8][payload].
// interface_data: version 1 = Vec<InterfaceCounters>.

pub(super) const BLOB_VERSION_INTERFACES: u8 = 1;

pub(super) fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

/// Payload after the version byte, or `None` for an empty blob or an unknown version.
pub(super) fn blob_payload(bytes: &[u8], expected_version: u8) -> Option<&[u8]> {
    match bytes.split_first() {
        Some((v, rest)) if *v == expected_version => Some(rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_then_payload() {
        let blob = with_version_prefix(BLOB_VERSION_INTERFACES, vec![7, 8]);
        assert_eq!(blob, vec![1, 7, 8]);
        assert_eq!(blob_payload(&blob, BLOB_VERSION_INTERFACES), Some(&[7u8, 8][..]));
    }

    #[test]
    fn unknown_version_or_empty_has_no_payload() {
        assert_eq!(blob_payload(&[9, 1], BLOB_VERSION_INTERFACES), None);
        assert_eq!(blob_payload(&[], BLOB_VERSION_INTERFACES), None);
    }
}
