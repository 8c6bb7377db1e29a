// Copyright 2025 The Quill Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Key encodings for the storage layer.
//!
//! Values are JSON, keys are raw byte strings: composite keys join their
//! components with a `0xff` separator (which can never occur in UTF-8, so
//! identifiers stay unambiguous), and timeline indices are big-endian 64-bit
//! integers so that byte order equals numeric order.

use ruma::{DeviceId, EventId, RoomId, UserId};

pub(crate) trait EncodeKey {
    const SEPARATOR: u8 = 0xff;
    fn encode(&self) -> Vec<u8>;
}

impl EncodeKey for str {
    fn encode(&self) -> Vec<u8> {
        [self.as_bytes(), &[Self::SEPARATOR]].concat()
    }
}

impl EncodeKey for RoomId {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl EncodeKey for UserId {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl EncodeKey for EventId {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl EncodeKey for DeviceId {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl EncodeKey for (&str, &str) {
    fn encode(&self) -> Vec<u8> {
        [
            self.0.as_bytes(),
            &[Self::SEPARATOR],
            self.1.as_bytes(),
            &[Self::SEPARATOR],
        ]
        .concat()
    }
}

impl EncodeKey for (&str, &str, &str) {
    fn encode(&self) -> Vec<u8> {
        [
            self.0.as_bytes(),
            &[Self::SEPARATOR],
            self.1.as_bytes(),
            &[Self::SEPARATOR],
            self.2.as_bytes(),
            &[Self::SEPARATOR],
        ]
        .concat()
    }
}

/// Big-endian key for a timeline index.
pub(crate) fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

pub(crate) fn decode_index(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

/// Split a composite key back into its components.
///
/// The trailing separator produces an empty last chunk, which is dropped.
pub(crate) fn split_key(key: &[u8]) -> Vec<&[u8]> {
    let mut parts: Vec<&[u8]> = key.split(|b| *b == 0xff).collect();
    if parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_round_trip() {
        let key = ("!room:example.org", "m.room.member", "@alice:example.org").encode();
        let parts = split_key(&key);
        assert_eq!(
            parts,
            vec![
                b"!room:example.org".as_slice(),
                b"m.room.member".as_slice(),
                b"@alice:example.org".as_slice(),
            ]
        );
    }

    #[test]
    fn index_keys_preserve_order() {
        let mid = u64::MAX / 2;
        assert!(index_key(mid - 1) < index_key(mid));
        assert!(index_key(mid) < index_key(mid + 1));
        assert_eq!(decode_index(&index_key(42)), Some(42));
    }

    #[test]
    fn separator_keeps_prefixes_unambiguous() {
        let prefix = "!room:example.org".encode();
        let inside = ("!room:example.org", "m.room.name").encode();
        let other = ("!room:example.orgX", "m.room.name").encode();
        assert!(inside.starts_with(&prefix));
        assert!(!other.starts_with(&prefix));
    }
}
