// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub const CHECKSUM_HELPER_PREFIX: &str = "ANDROID_EMU_CHECKSUM_HELPER_v";
pub const CHECKSUM_MAX_VERSION: u32 = 1;

const CHECKSUM_V1_SIZE: usize = 8;

/// Per-stream checksum state.  Each direction keeps its own sequence counter; the guest and the
/// host must agree on the version before either side emits a trailer.
#[derive(Debug, Default, Clone)]
pub struct ChecksumCalculator {
    version: u32,
    num_write: u32,
    num_read: u32,
}

impl ChecksumCalculator {
    pub fn new() -> ChecksumCalculator {
        Default::default()
    }

    /// Installs `version`.  Returns false and leaves the state untouched if it is unsupported.
    pub fn set_version(&mut self, version: u32) -> bool {
        if version > CHECKSUM_MAX_VERSION {
            return false;
        }
        self.version = version;
        true
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Size of the trailer appended to each packet under the current version.
    pub fn checksum_byte_size(&self) -> usize {
        match self.version {
            1 => CHECKSUM_V1_SIZE,
            _ => 0,
        }
    }

    /// The extension token advertising the newest version this side understands.
    pub fn max_version_str() -> String {
        format!("{}{}", CHECKSUM_HELPER_PREFIX, CHECKSUM_MAX_VERSION)
    }

    /// Picks `min(host, guest_max)` from the host extension string; 0 if the host advertises
    /// nothing.
    pub fn negotiate(host_extensions: &str, guest_max: u32) -> u32 {
        host_extensions
            .split_whitespace()
            .find_map(|token| token.strip_prefix(CHECKSUM_HELPER_PREFIX))
            .and_then(|v| v.parse::<u32>().ok())
            .map(|host_version| host_version.min(guest_max))
            .unwrap_or(0)
    }

    fn compute(&self, packet: &[u8], sequence: u32) -> [u8; CHECKSUM_V1_SIZE] {
        let mut trailer = [0u8; CHECKSUM_V1_SIZE];
        let len = (packet.len() as u32).reverse_bits();
        trailer[..4].copy_from_slice(&len.to_le_bytes());
        trailer[4..].copy_from_slice(&sequence.to_le_bytes());
        trailer
    }

    /// Appends the trailer for `packet` (header and payload) to `out`.
    pub fn write_checksum(&mut self, packet: &[u8], out: &mut Vec<u8>) {
        if self.version == 0 {
            return;
        }
        let trailer = self.compute(packet, self.num_write);
        self.num_write = self.num_write.wrapping_add(1);
        out.extend_from_slice(&trailer);
    }

    /// Checks `trailer` against `packet`.  The read counter advances even on mismatch.
    pub fn validate(&mut self, packet: &[u8], trailer: &[u8]) -> bool {
        if self.version == 0 {
            return trailer.is_empty();
        }
        let expected = self.compute(packet, self.num_read);
        self.num_read = self.num_read.wrapping_add(1);
        trailer == expected
    }

    /// Sequence number that the next validated packet must carry.
    pub fn read_sequence(&self) -> u32 {
        self.num_read
    }

    /// Restores counters saved alongside a render thread.
    pub fn restore(version: u32, num_write: u32, num_read: u32) -> ChecksumCalculator {
        ChecksumCalculator {
            version: version.min(CHECKSUM_MAX_VERSION),
            num_write,
            num_read,
        }
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.num_write, self.num_read)
    }
}
