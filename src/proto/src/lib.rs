// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Conversions between Rust types and their protobuf representations.
//!
//! Persisted state (manifests, tracker blobs, STM snapshots) is encoded as
//! protobuf messages. The message structs live next to the types they mirror;
//! this crate only provides the conversion vocabulary: [`RustType`] for the
//! Rust side and [`TryFromProtoError`] for decode failures.
//!
//! The `into_proto` direction is infallible: every valid Rust value has a
//! proto representation. The `from_proto` direction is fallible because
//! protos arrive from storage and may predate or postdate the running
//! version, or be corrupt.

use std::char::CharTryFromError;
use std::num::TryFromIntError;

/// An error that can occur when converting a protobuf message into a Rust
/// type.
#[derive(Debug, thiserror::Error)]
pub enum TryFromProtoError {
    /// An integer field did not fit the target Rust type.
    #[error("int conversion: {0}")]
    TryFromIntError(#[from] TryFromIntError),
    /// A char field carried an invalid code point.
    #[error("char conversion: {0}")]
    CharTryFromError(#[from] CharTryFromError),
    /// A required `optional` field was absent.
    #[error("missing field: {0}")]
    MissingField(String),
    /// An enum field carried an unknown discriminant.
    #[error("unknown enum variant: {0}")]
    UnknownEnumVariant(String),
    /// Anything else; the string names the field and the problem.
    #[error("invalid persisted state: {0}")]
    InvalidPersistedState(String),
}

impl TryFromProtoError {
    pub fn missing_field<T: ToString>(field: T) -> TryFromProtoError {
        TryFromProtoError::MissingField(field.to_string())
    }

    pub fn unknown_enum_variant<T: ToString>(description: T) -> TryFromProtoError {
        TryFromProtoError::UnknownEnumVariant(description.to_string())
    }
}

/// A type that can be converted to and from its protobuf mirror type.
pub trait RustType<Proto>: Sized {
    /// Converts `self` into the proto representation.
    fn into_proto(&self) -> Proto;

    /// Converts a proto value back, validating as it goes.
    fn from_proto(proto: Proto) -> Result<Self, TryFromProtoError>;
}

/// The inverse perspective of [`RustType`], implemented blanket-wise so proto
/// values can be converted with `proto.into_rust()`.
pub trait ProtoType<Rust>: Sized {
    fn into_rust(self) -> Result<Rust, TryFromProtoError>;

    fn from_rust(rust: &Rust) -> Self;
}

impl<P, R> ProtoType<R> for P
where
    R: RustType<P>,
{
    fn into_rust(self) -> Result<R, TryFromProtoError> {
        R::from_proto(self)
    }

    fn from_rust(rust: &R) -> Self {
        rust.into_proto()
    }
}

/// Unpacks an `Option<Proto>` that is semantically required, producing a
/// `MissingField` error when absent.
pub trait IntoRustIfSome<T> {
    fn into_rust_if_some<S: ToString>(self, field: S) -> Result<T, TryFromProtoError>;
}

impl<R, P> IntoRustIfSome<R> for Option<P>
where
    R: RustType<P>,
{
    fn into_rust_if_some<S: ToString>(self, field: S) -> Result<R, TryFromProtoError> {
        R::from_proto(self.ok_or_else(|| TryFromProtoError::missing_field(field))?)
    }
}

impl<P, R> RustType<Option<P>> for Option<R>
where
    R: RustType<P>,
{
    fn into_proto(&self) -> Option<P> {
        self.as_ref().map(|r| r.into_proto())
    }

    fn from_proto(proto: Option<P>) -> Result<Self, TryFromProtoError> {
        proto.map(R::from_proto).transpose()
    }
}

impl<P, R> RustType<Vec<P>> for Vec<R>
where
    R: RustType<P>,
{
    fn into_proto(&self) -> Vec<P> {
        self.iter().map(|r| r.into_proto()).collect()
    }

    fn from_proto(proto: Vec<P>) -> Result<Self, TryFromProtoError> {
        proto.into_iter().map(R::from_proto).collect()
    }
}

macro_rules! identity_rust_type {
    ($t:ty) => {
        impl RustType<$t> for $t {
            fn into_proto(&self) -> $t {
                self.clone()
            }

            fn from_proto(proto: $t) -> Result<Self, TryFromProtoError> {
                Ok(proto)
            }
        }
    };
}

// NB: no identity impl for `Vec<u8>`; it would conflict with the blanket
// `Vec<R>` impl above under the coherence rules.
identity_rust_type!(bool);
identity_rust_type!(u32);
identity_rust_type!(u64);
identity_rust_type!(i32);
identity_rust_type!(i64);
identity_rust_type!(String);
