use std::io;

/// RTP fixed header length (RFC 3550 §5.1).
pub const RTP_HEADER_LEN: usize = 12;

/// A received RTP packet, borrowed from the datagram or interleaved frame.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                    CSRC list (CC entries)                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// CSRC entries, the header extension (X) and padding (P) are skipped;
/// [`payload`](Self::payload) is what remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    pub fn parse(data: &'a [u8]) -> io::Result<Self> {
        let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, format!("rtp: {what}"));

        if data.len() < RTP_HEADER_LEN {
            return Err(invalid("packet shorter than fixed header"));
        }
        if data[0] >> 6 != 2 {
            return Err(invalid("unsupported version"));
        }

        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = usize::from(data[0] & 0x0f);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if extension {
            let words = data
                .get(offset + 2..offset + 4)
                .ok_or_else(|| invalid("truncated header extension"))?;
            offset += 4 + usize::from(u16::from_be_bytes([words[0], words[1]])) * 4;
        }

        let mut end = data.len();
        if padding {
            let pad = usize::from(data[end - 1]);
            end = end
                .checked_sub(pad)
                .filter(|&end| end >= offset && pad > 0)
                .ok_or_else(|| invalid("bad padding"))?;
        }
        if offset > end {
            return Err(invalid("header overruns packet"));
        }

        Ok(RtpPacket {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: &data[offset..end],
        })
    }
}

/// RTCP packet types occupy 200..=204 in the second byte, which collides
/// with RTP payload types 72..=76 plus the marker bit (RFC 5761 §4).
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (200..=204).contains(&data[1])
}

/// Sender-side header state for producing test packets.
#[cfg(test)]
#[derive(Debug)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

#[cfg(test)]
impl RtpHeader {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Header followed by `payload`; advances the sequence number.
    pub fn packet(&mut self, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        packet.push(2 << 6);
        packet.push((u8::from(marker) << 7) | (self.payload_type & 0x7f));
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.extend_from_slice(payload);

        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_written_packet() {
        let mut header = RtpHeader::new(96, 0xAABBCCDD);
        header.advance_timestamp(3000);
        let bytes = header.packet(true, b"frame");

        let packet = RtpPacket::parse(&bytes).unwrap();
        assert!(packet.marker);
        assert_eq!(packet.payload_type, 96);
        assert_eq!(packet.sequence, 0);
        assert_eq!(packet.timestamp, 3000);
        assert_eq!(packet.ssrc, 0xAABBCCDD);
        assert_eq!(packet.payload, b"frame");
    }

    #[test]
    fn sequence_wraps() {
        let mut header = RtpHeader::new(96, 1);
        header.sequence = u16::MAX;
        let bytes = header.packet(false, &[]);
        assert_eq!(RtpPacket::parse(&bytes).unwrap().sequence, u16::MAX);
        assert_eq!(header.sequence, 0);
    }

    #[test]
    fn skips_csrc_extension_and_padding() {
        let mut bytes = vec![0x80 | 0x20 | 0x10 | 0x01, 96, 0, 7, 0, 0, 0, 9, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // CSRC
        bytes.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01, 1, 2, 3, 4]); // one-word extension
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(&[0, 0, 3]); // padding

        let packet = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(packet.sequence, 7);
        assert_eq!(packet.timestamp, 9);
        assert_eq!(packet.payload, b"abc");
    }

    #[test]
    fn rejects_short_and_wrong_version() {
        assert!(RtpPacket::parse(&[0x80, 96, 0]).is_err());
        assert!(RtpPacket::parse(&[0x40; 12]).is_err());
    }

    #[test]
    fn rejects_padding_larger_than_payload() {
        let mut bytes = vec![0xa0, 96, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        bytes.push(40);
        assert!(RtpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn rtcp_detection() {
        assert!(is_rtcp(&[0x80, 200, 0, 6]));
        assert!(!is_rtcp(&[0x80, 96, 0, 6]));
        assert!(!is_rtcp(&[0x80]));
    }
}
