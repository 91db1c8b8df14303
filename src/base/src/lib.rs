// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runtime utilities shared across shoal crates.

pub mod codec;
pub mod retry;
pub mod task;

pub use tokio_util::sync::CancellationToken;
