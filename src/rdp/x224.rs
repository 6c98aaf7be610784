//! TPKT and X.224 connection-sequence codec.
//!
//! Only the pieces the MITM needs: reading the client's Connection
//! Request (routing cookie plus the RDP negotiation request) and writing
//! a Connection Confirm that selects the security protocol. Everything
//! after the confirm is an opaque byte stream to the gateway.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Plain RDP security (no TLS).
pub const PROTOCOL_RDP: u32 = 0;
/// TLS security.
pub const PROTOCOL_SSL: u32 = 1;
/// CredSSP (NLA); negotiated down to TLS by the MITM.
pub const PROTOCOL_HYBRID: u32 = 2;

const TPKT_VERSION: u8 = 3;
const X224_CONNECTION_REQUEST: u8 = 0xE0;
const NEG_REQ_TYPE: u8 = 0x01;
const NEG_RSP_TYPE: u8 = 0x02;

/// A parsed X.224 Connection Request.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// `Cookie: mstshash=` routing token, when the client sent one.
    pub cookie: Option<String>,
    /// Bitmask of security protocols the client offers (`PROTOCOL_*`).
    pub requested_protocols: u32,
    /// The full TPKT packet as received, for pass-through to the backend.
    pub raw: Vec<u8>,
}

impl ConnectionRequest {
    /// Whether the client can do TLS.
    #[must_use]
    pub const fn offers_tls(&self) -> bool {
        self.requested_protocols & (PROTOCOL_SSL | PROTOCOL_HYBRID) != 0
    }
}

/// Read one TPKT-framed packet, returning the complete packet including
/// its 4-byte header.
///
/// # Errors
///
/// `InvalidData` on a bad version or length; otherwise the underlying IO
/// error.
pub async fn read_tpkt<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != TPKT_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("not a TPKT packet (version {})", header[0]),
        ));
    }

    let length = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if length < 7 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("TPKT length {length} too short"),
        ));
    }

    let mut packet = vec![0u8; length];
    packet[..4].copy_from_slice(&header);
    stream.read_exact(&mut packet[4..]).await?;
    Ok(packet)
}

/// Parse an X.224 Connection Request out of a TPKT packet.
///
/// # Errors
///
/// `InvalidData` when the packet is not a CR TPDU.
pub fn parse_connection_request(packet: &[u8]) -> std::io::Result<ConnectionRequest> {
    let payload = packet.get(4..).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "truncated TPKT")
    })?;

    if payload.len() < 7 || payload[1] & 0xF0 != X224_CONNECTION_REQUEST {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not an X.224 Connection Request",
        ));
    }

    // Variable part: optional routing cookie line, optional negotiation
    // request trailer.
    let variable = &payload[7..];

    let cookie = find_cookie(variable);

    let requested_protocols = if variable.len() >= 8 {
        let trailer = &variable[variable.len() - 8..];
        if trailer[0] == NEG_REQ_TYPE
            && u16::from_le_bytes([trailer[2], trailer[3]]) == 8
        {
            u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]])
        } else {
            PROTOCOL_RDP
        }
    } else {
        PROTOCOL_RDP
    };

    Ok(ConnectionRequest {
        cookie,
        requested_protocols,
        raw: packet.to_vec(),
    })
}

/// Encode an X.224 Connection Confirm selecting `selected_protocol`.
#[must_use]
pub fn connection_confirm(selected_protocol: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(19);
    // TPKT header.
    packet.extend_from_slice(&[TPKT_VERSION, 0, 0, 19]);
    // X.224 CC TPDU: LI, code, dst-ref, src-ref, class.
    packet.extend_from_slice(&[14, 0xD0, 0, 0, 0, 0, 0]);
    // RDP negotiation response.
    packet.push(NEG_RSP_TYPE);
    packet.push(0); // flags
    packet.extend_from_slice(&8u16.to_le_bytes());
    packet.extend_from_slice(&selected_protocol.to_le_bytes());
    packet
}

/// Parse the protocol a Connection Confirm selected, `None` when the
/// packet carries no negotiation response (legacy server).
#[must_use]
pub fn parse_selected_protocol(packet: &[u8]) -> Option<u32> {
    let payload = packet.get(4..)?;
    if payload.len() < 7 || payload[1] & 0xF0 != 0xD0 {
        return None;
    }
    let trailer = payload.get(payload.len().checked_sub(8)?..)?;
    if trailer[0] == NEG_RSP_TYPE && u16::from_le_bytes([trailer[2], trailer[3]]) == 8 {
        Some(u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]))
    } else {
        None
    }
}

fn find_cookie(variable: &[u8]) -> Option<String> {
    const TOKEN: &[u8] = b"Cookie: mstshash=";
    let start = variable
        .windows(TOKEN.len())
        .position(|w| w == TOKEN)?
        + TOKEN.len();
    let rest = &variable[start..];
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    String::from_utf8(rest[..end].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_cr(cookie: Option<&str>, protocols: Option<u32>) -> Vec<u8> {
        let mut variable = Vec::new();
        if let Some(cookie) = cookie {
            variable.extend_from_slice(b"Cookie: mstshash=");
            variable.extend_from_slice(cookie.as_bytes());
            variable.extend_from_slice(b"\r\n");
        }
        if let Some(protocols) = protocols {
            variable.push(NEG_REQ_TYPE);
            variable.push(0);
            variable.extend_from_slice(&8u16.to_le_bytes());
            variable.extend_from_slice(&protocols.to_le_bytes());
        }

        let length = 4 + 7 + variable.len();
        let mut packet = vec![TPKT_VERSION, 0];
        packet.extend_from_slice(&u16::try_from(length).unwrap().to_be_bytes());
        let li = u8::try_from(6 + variable.len()).unwrap();
        packet.extend_from_slice(&[li, X224_CONNECTION_REQUEST, 0, 0, 0, 0, 0]);
        packet.extend_from_slice(&variable);
        packet
    }

    #[tokio::test]
    async fn round_trips_a_connection_request() {
        let packet = build_cr(Some("bob"), Some(PROTOCOL_SSL | PROTOCOL_HYBRID));
        let mut reader = std::io::Cursor::new(packet.clone());

        let read = read_tpkt(&mut reader).await.unwrap();
        assert_eq!(read, packet);

        let cr = parse_connection_request(&read).unwrap();
        assert_eq!(cr.cookie.as_deref(), Some("bob"));
        assert!(cr.offers_tls());
        assert_eq!(cr.raw, packet);
    }

    #[tokio::test]
    async fn legacy_client_without_negotiation_is_plain_rdp() {
        let packet = build_cr(None, None);
        let cr = parse_connection_request(&packet).unwrap();
        assert_eq!(cr.requested_protocols, PROTOCOL_RDP);
        assert!(!cr.offers_tls());
        assert!(cr.cookie.is_none());
    }

    #[tokio::test]
    async fn rejects_non_tpkt_traffic() {
        let mut reader = std::io::Cursor::new(b"GET / HTTP/1.1\r\n".to_vec());
        assert!(read_tpkt(&mut reader).await.is_err());
    }

    #[test]
    fn connection_confirm_is_well_formed() {
        let cc = connection_confirm(PROTOCOL_SSL);
        assert_eq!(cc.len(), 19);
        assert_eq!(cc[0], TPKT_VERSION);
        assert_eq!(u16::from_be_bytes([cc[2], cc[3]]), 19);
        assert_eq!(cc[5], 0xD0);
        assert_eq!(cc[11], NEG_RSP_TYPE);
        assert_eq!(
            u32::from_le_bytes([cc[15], cc[16], cc[17], cc[18]]),
            PROTOCOL_SSL
        );
    }
}
