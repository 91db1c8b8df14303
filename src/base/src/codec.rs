// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Encoding of persisted blobs.

use bytes::BufMut;

/// A self-describing encoding for a blob persisted to the object store or
/// the local kv-store.
///
/// Implementations must be byte-stable: encoding equal values always
/// produces identical bytes, because object keys and change detection both
/// rely on it.
pub trait Codec: Sized {
    /// Name of the codec, used in error messages and sanity checks.
    fn codec_name() -> String;

    /// Encode `self` into `buf`.
    ///
    /// This must perfectly round-trip through [`Codec::decode`]:
    /// `decode(encode(x)) == x`.
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Decode a value previously produced by [`Codec::encode`].
    fn decode(buf: &[u8]) -> Result<Self, String>;

    /// Convenience wrapper encoding into a fresh `Vec<u8>`.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}
