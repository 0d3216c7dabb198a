//! Fixed-layout coordination block record and checksum

/// Total encoded size of the coordination block in bytes
pub const BLOCK_LEN: usize = 146;

/// Byte offset of the primary-alive flag
pub const OFF_PRIMARY_ALIVE: usize = 0;
/// Byte offset of the secondary counter
pub const OFF_SECONDARY_COUNT: usize = 4;
/// Byte offset of the primary process id
pub const OFF_PRIMARY_PID: usize = 8;
/// Byte offset of the primary user name buffer
pub const OFF_PRIMARY_USER: usize = 16;
/// Byte offset of the checksum field
pub const OFF_CHECKSUM: usize = 144;

/// Width of the primary user name buffer (nul-terminated)
pub const USER_NAME_LEN: usize = 128;

/// In-memory value of the shared coordination block.
///
/// The shared segment stores this record in a fixed little-endian layout; all
/// reads and writes of the raw bytes go through [`encode`](Self::encode) and
/// [`decode`](Self::decode) so the byte-layout concern stays in this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationBlock {
    /// True once a primary has been designated and not detected as crashed
    pub primary_alive: bool,
    /// Count of secondaries ever admitted since the last (re)initialization
    pub secondary_count: u32,
    /// Process id of the current primary
    pub primary_pid: i64,
    /// User name of the current primary (truncated to 127 bytes)
    pub primary_user: String,
}

impl CoordinationBlock {
    /// Block value representing "no primary, zero secondaries"
    pub fn empty() -> Self {
        Self {
            primary_alive: false,
            secondary_count: 0,
            primary_pid: 0,
            primary_user: String::new(),
        }
    }

    /// Mark this block as claimed by the given primary
    pub fn set_primary(&mut self, pid: i64, user: &str) {
        self.primary_alive = true;
        self.primary_pid = pid;
        self.primary_user = truncate_user(user);
    }

    /// Reset to the empty state
    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    /// Encode into the fixed layout, with a freshly computed checksum
    pub fn encode(&self) -> [u8; BLOCK_LEN] {
        let mut buf = [0u8; BLOCK_LEN];
        buf[OFF_PRIMARY_ALIVE] = self.primary_alive as u8;
        buf[OFF_SECONDARY_COUNT..OFF_SECONDARY_COUNT + 4]
            .copy_from_slice(&self.secondary_count.to_le_bytes());
        buf[OFF_PRIMARY_PID..OFF_PRIMARY_PID + 8]
            .copy_from_slice(&self.primary_pid.to_le_bytes());

        let user = truncate_user(&self.primary_user);
        buf[OFF_PRIMARY_USER..OFF_PRIMARY_USER + user.len()].copy_from_slice(user.as_bytes());

        let sum = checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&sum.to_le_bytes());
        buf
    }

    /// Decode the fixed layout without consistency judgement.
    ///
    /// Returns the decoded block together with the stored and the freshly
    /// computed checksum; callers compare the two to detect a writer that
    /// died mid-update.
    pub fn decode(buf: &[u8; BLOCK_LEN]) -> (Self, u16, u16) {
        let primary_alive = buf[OFF_PRIMARY_ALIVE] != 0;
        let secondary_count = u32::from_le_bytes(
            buf[OFF_SECONDARY_COUNT..OFF_SECONDARY_COUNT + 4]
                .try_into()
                .unwrap_or([0; 4]),
        );
        let primary_pid = i64::from_le_bytes(
            buf[OFF_PRIMARY_PID..OFF_PRIMARY_PID + 8]
                .try_into()
                .unwrap_or([0; 8]),
        );

        let user_buf = &buf[OFF_PRIMARY_USER..OFF_PRIMARY_USER + USER_NAME_LEN];
        let user_len = user_buf.iter().position(|&b| b == 0).unwrap_or(USER_NAME_LEN);
        let primary_user = String::from_utf8_lossy(&user_buf[..user_len]).into_owned();

        let stored = u16::from_le_bytes(
            buf[OFF_CHECKSUM..OFF_CHECKSUM + 2]
                .try_into()
                .unwrap_or([0; 2]),
        );
        let computed = checksum(buf);

        (
            Self {
                primary_alive,
                secondary_count,
                primary_pid,
                primary_user,
            },
            stored,
            computed,
        )
    }
}

/// Checksum over every field except the checksum itself.
///
/// CRC32 truncated to the 16-bit field width; deterministic across processes.
pub fn checksum(buf: &[u8; BLOCK_LEN]) -> u16 {
    crc32fast::hash(&buf[..OFF_CHECKSUM]) as u16
}

/// Truncate a user name to fit the nul-terminated 128-byte buffer
fn truncate_user(user: &str) -> String {
    let end = user.find('\0').unwrap_or(user.len());
    let mut cut = end.min(USER_NAME_LEN - 1);
    // Back off to a char boundary so the truncated name stays valid UTF-8
    while cut > 0 && !user.is_char_boundary(cut) {
        cut -= 1;
    }
    user[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut block = CoordinationBlock::empty();
        block.set_primary(4321, "operator");
        block.secondary_count = 7;

        let buf = block.encode();
        let (decoded, stored, computed) = CoordinationBlock::decode(&buf);

        assert_eq!(decoded, block);
        assert_eq!(stored, computed);
    }

    #[test]
    fn test_empty_block_is_consistent() {
        let buf = CoordinationBlock::empty().encode();
        let (decoded, stored, computed) = CoordinationBlock::decode(&buf);
        assert_eq!(stored, computed);
        assert!(!decoded.primary_alive);
        assert_eq!(decoded.secondary_count, 0);
        assert_eq!(decoded.primary_pid, 0);
        assert!(decoded.primary_user.is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let mut buf = CoordinationBlock::empty().encode();

        // Flip a checksum byte: stored and computed must now disagree
        buf[OFF_CHECKSUM] ^= 0xFF;
        let (_, stored, computed) = CoordinationBlock::decode(&buf);
        assert_ne!(stored, computed);

        // Flip a data byte instead: same outcome
        let mut buf = CoordinationBlock::empty().encode();
        buf[OFF_SECONDARY_COUNT] ^= 0x01;
        let (_, stored, computed) = CoordinationBlock::decode(&buf);
        assert_ne!(stored, computed);
    }

    #[test]
    fn test_user_name_truncation() {
        let long = "x".repeat(300);
        let mut block = CoordinationBlock::empty();
        block.set_primary(1, &long);
        assert_eq!(block.primary_user.len(), USER_NAME_LEN - 1);

        let buf = block.encode();
        let (decoded, stored, computed) = CoordinationBlock::decode(&buf);
        assert_eq!(stored, computed);
        assert_eq!(decoded.primary_user.len(), USER_NAME_LEN - 1);
    }

    #[test]
    fn test_user_name_interior_nul() {
        let mut block = CoordinationBlock::empty();
        block.set_primary(1, "alice\0mallory");
        assert_eq!(block.primary_user, "alice");
    }

    #[test]
    fn test_layout_offsets() {
        let mut block = CoordinationBlock::empty();
        block.set_primary(0x0102030405060708, "u");
        block.secondary_count = 0xAABBCCDD;
        let buf = block.encode();

        assert_eq!(buf[OFF_PRIMARY_ALIVE], 1);
        assert_eq!(&buf[1..4], &[0, 0, 0]);
        assert_eq!(&buf[OFF_SECONDARY_COUNT..OFF_SECONDARY_COUNT + 4], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(buf[OFF_PRIMARY_PID], 0x08);
        assert_eq!(buf[OFF_PRIMARY_USER], b'u');
        assert_eq!(buf[OFF_PRIMARY_USER + 1], 0);
    }
}
