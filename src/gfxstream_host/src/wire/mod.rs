// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoding shared by the guest encoders and the host decoders.

mod checksum;
mod codec;
mod extensions;

pub use checksum::*;
pub use codec::*;
pub use extensions::*;
