//! RTP-style media packet header: version/payload-type marker, then
//! big-endian sequence, timestamp, and ssrc.

pub const RTP_HEADER_LEN: usize = 12;

pub const RTP_VERSION: u8 = 0x80;
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

pub fn encode_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = RTP_VERSION;
    header[1] = RTP_PAYLOAD_TYPE;
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

pub fn parse_header(header: &[u8; RTP_HEADER_LEN]) -> RtpHeader {
    RtpHeader {
        sequence: u16::from_be_bytes([header[2], header[3]]),
        timestamp: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        ssrc: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = encode_header(4660, 0xDEAD_BEEF, 0x0102_0304);
        assert_eq!(header[0], RTP_VERSION);
        assert_eq!(header[1], RTP_PAYLOAD_TYPE);
        let parsed = parse_header(&header);
        assert_eq!(parsed.sequence, 4660);
        assert_eq!(parsed.timestamp, 0xDEAD_BEEF);
        assert_eq!(parsed.ssrc, 0x0102_0304);
    }
}
