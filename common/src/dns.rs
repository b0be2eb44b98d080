//! Minimal DNS responder for the provisioning access point. Every query is
//! answered with the portal gateway address so clients land on the portal
//! regardless of the name they ask for.

use crate::portal::AP_IP;

pub const DNS_PORT: u16 = 53;

/// TTL kept short so clients drop the hijacked record quickly after
/// provisioning completes.
const ANSWER_TTL_SECS: u32 = 60;

const HEADER_LEN: usize = 12;
const FLAG_QR_RESPONSE: u16 = 0x8000;
const FLAGS_RESPONSE: u16 = 0x8180;

/// Builds a response for one DNS query datagram, or `None` when the packet
/// is malformed or is itself a response. The reply echoes the question and
/// carries a single A record pointing at the gateway, with the answer name
/// compressed as a pointer to the question at offset 12.
pub fn answer_query(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    if flags & FLAG_QR_RESPONSE != 0 {
        return None;
    }

    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if qdcount == 0 {
        return None;
    }

    // Walk the first question's name. Compression is not valid here.
    let mut offset = HEADER_LEN;
    loop {
        let len = *query.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        if len > 63 {
            return None;
        }
        offset += 1 + len;
        if offset >= query.len() {
            return None;
        }
    }

    // QTYPE and QCLASS follow the name.
    let question_end = offset + 4;
    if question_end > query.len() {
        return None;
    }

    let mut response = Vec::with_capacity(question_end + 16);
    response.extend_from_slice(&query[0..2]);
    response.extend_from_slice(&FLAGS_RESPONSE.to_be_bytes());
    response.extend_from_slice(&1_u16.to_be_bytes()); // QDCOUNT
    response.extend_from_slice(&1_u16.to_be_bytes()); // ANCOUNT
    response.extend_from_slice(&0_u16.to_be_bytes()); // NSCOUNT
    response.extend_from_slice(&0_u16.to_be_bytes()); // ARCOUNT
    response.extend_from_slice(&query[HEADER_LEN..question_end]);

    response.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
    response.extend_from_slice(&1_u16.to_be_bytes()); // TYPE A
    response.extend_from_slice(&1_u16.to_be_bytes()); // CLASS IN
    response.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    response.extend_from_slice(&4_u16.to_be_bytes()); // RDLENGTH
    response.extend_from_slice(&AP_IP.octets());

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn query_for(name: &[&str]) -> Vec<u8> {
        let mut packet = vec![
            0xAB, 0xCD, // ID
            0x01, 0x00, // RD set, standard query
            0x00, 0x01, // QDCOUNT
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
        packet
    }

    #[test]
    fn answers_with_gateway_address() {
        let query = query_for(&["connectivitycheck", "gstatic", "com"]);
        let response = answer_query(&query).unwrap();

        // ID echoed, response flags set.
        assert_eq!(&response[0..2], &[0xAB, 0xCD]);
        assert_eq!(u16::from_be_bytes([response[2], response[3]]), 0x8180);
        // One question, one answer.
        assert_eq!(u16::from_be_bytes([response[4], response[5]]), 1);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);
        // Question section echoed byte for byte.
        assert_eq!(&response[12..query.len()], &query[12..]);
        // Answer: name pointer, A record, TTL 60, 192.168.4.1.
        let answer = &response[query.len()..];
        assert_eq!(&answer[0..2], &[0xC0, 0x0C]);
        assert_eq!(&answer[2..4], &[0x00, 0x01]);
        assert_eq!(&answer[4..6], &[0x00, 0x01]);
        assert_eq!(&answer[6..10], &60_u32.to_be_bytes());
        assert_eq!(&answer[10..12], &[0x00, 0x04]);
        assert_eq!(&answer[12..16], &[192, 168, 4, 1]);
    }

    #[test]
    fn non_a_queries_still_get_the_gateway() {
        let mut query = query_for(&["example", "com"]);
        let qtype_at = query.len() - 4;
        query[qtype_at + 1] = 28; // AAAA
        let response = answer_query(&query).unwrap();
        assert_eq!(&response[response.len() - 4..], &[192, 168, 4, 1]);
    }

    #[test]
    fn truncated_header_is_ignored() {
        assert_eq!(answer_query(&[0xAB, 0xCD, 0x01]), None);
    }

    #[test]
    fn truncated_question_is_ignored() {
        let mut query = query_for(&["example", "com"]);
        query.truncate(query.len() - 3);
        assert_eq!(answer_query(&query), None);
    }

    #[test]
    fn responses_are_ignored() {
        let mut query = query_for(&["example", "com"]);
        query[2] = 0x81; // QR bit set
        assert_eq!(answer_query(&query), None);
    }

    #[test]
    fn zero_question_count_is_ignored() {
        let mut query = query_for(&["example", "com"]);
        query[5] = 0;
        assert_eq!(answer_query(&query), None);
    }

    #[test]
    fn oversized_label_is_ignored() {
        let mut packet = vec![0u8; 12];
        packet[5] = 1; // QDCOUNT
        packet.push(64); // label length above the 63 byte limit
        packet.extend_from_slice(&[b'a'; 64]);
        packet.push(0);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        assert_eq!(answer_query(&packet), None);
    }
}
