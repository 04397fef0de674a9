pub struct Utils;

impl Utils {
    /// Read a little-endian u16 at `offset`.
    pub fn u16ify(data: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    /// Write `value` little-endian at `offset`.
    pub fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn format_hex(data: &[u8]) -> String {
        let mut out = String::with_capacity(data.len() * 3);
        for b in data {
            out.push_str(&format!("{:02X} ", b));
        }
        out.trim_end().to_string()
    }
}
