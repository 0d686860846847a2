// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

#[macro_use]
pub mod decoder;
pub mod encoder;

pub use decoder::*;
pub use encoder::*;
