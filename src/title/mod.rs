// title/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root for all title-related modules.

pub mod cert;
pub mod cia;
pub mod commonkeys;
pub mod crypto;
pub mod ticket;
pub mod tmd;

/// Splits a Title ID into its high and low halves, formatted as lowercase hex the way they appear
/// in title paths.
pub fn title_id_halves(title_id: u64) -> (String, String) {
    (format!("{:08x}", title_id >> 32), format!("{:08x}", title_id as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_id_halves() {
        let (high, low) = title_id_halves(0x0004000000ABCD00);
        assert_eq!(high, "00040000");
        assert_eq!(low, "00abcd00");
    }
}
