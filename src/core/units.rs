//! 字节数换算，用于能力报告中的显存大小

pub const fn to_kb(bytes: u64) -> u64 {
    bytes / 1024
}

pub const fn to_mb(bytes: u64) -> u64 {
    to_kb(bytes) / 1024
}

pub const fn to_gb(bytes: u64) -> u64 {
    to_mb(bytes) / 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(to_kb(4096), 4);
        assert_eq!(to_mb(8 * 1024 * 1024), 8);
        assert_eq!(to_gb(3 * 1024 * 1024 * 1024 + 5), 3);
    }
}
