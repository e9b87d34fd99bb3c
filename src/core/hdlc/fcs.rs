//! Frame check sequence
//!
//! 16-bit FCS as used by PPP (RFC 1662), also known as CRC-16/X-25:
//! - Polynomial 0x1021, processed reflected (0x8408)
//! - Initial value 0xFFFF, ones-complement on transmit
//! - Sent least significant octet first

/// Initial FCS value
pub const FCS_INIT: u16 = 0xFFFF;

/// Residue left over a frame whose trailing FCS is intact
pub const FCS_GOOD: u16 = 0xF0B8;

/// Number of octets the FCS occupies on the wire
pub const FCS_LEN: usize = 2;

const POLY_REFLECTED: u16 = 0x8408;

const FCS_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Feed `data` into a running FCS
pub fn update(mut fcs: u16, data: &[u8]) -> u16 {
    for &byte in data {
        fcs = (fcs >> 8) ^ FCS_TABLE[usize::from((fcs ^ u16::from(byte)) & 0x00FF)];
    }
    fcs
}

/// FCS octets to append to `data`, in transmission order
pub fn compute(data: &[u8]) -> [u8; FCS_LEN] {
    let fcs = !update(FCS_INIT, data);
    fcs.to_le_bytes()
}

/// Check a frame body that still carries its trailing FCS
pub fn verify(data_with_fcs: &[u8]) -> bool {
    data_with_fcs.len() >= FCS_LEN && update(FCS_INIT, data_with_fcs) == FCS_GOOD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // CRC-16/X-25 check value for "123456789"
        let fcs = !update(FCS_INIT, b"123456789");
        assert_eq!(fcs, 0x906E);
        assert_eq!(compute(b"123456789"), [0x6E, 0x90]);
    }

    #[test]
    fn test_verify_appended() {
        let mut frame = vec![0x30, 0x3F];
        frame.extend_from_slice(&compute(&frame));
        assert!(verify(&frame));

        frame[1] ^= 0x01;
        assert!(!verify(&frame));
    }

    #[test]
    fn test_single_octet_corruption_detected() {
        let mut frame: Vec<u8> = (0u8..64).collect();
        let fcs = compute(&frame);
        frame.extend_from_slice(&fcs);

        for index in 0..frame.len() {
            for flip in [0x01u8, 0x80, 0xFF, 0x5A] {
                let mut corrupted = frame.clone();
                corrupted[index] ^= flip;
                assert!(!verify(&corrupted), "corruption at {index} with {flip:#04x} undetected");
            }
        }
    }

    #[test]
    fn test_too_short() {
        assert!(!verify(&[0xB8]));
    }
}
