pub mod buffer;
pub mod hash;
pub mod packet;

#[cfg(test)]
mod tests {
    use crate::buffer::PacketBuffer;
    use crate::packet::record::{RData, Record};
    use crate::packet::{Packet, QueryType};
    use similar_asserts::assert_eq;

    // A registration PTR response as it appears on the wire: the rdata
    // compresses its service suffix with a pointer back to the owner name.
    const PTR_RESPONSE: &[u8] = &[
        0x00, 0x00, 0x84, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x05, 0x5f, 0x74,
        0x65, 0x73, 0x74, 0x04, 0x5f, 0x74, 0x63, 0x70, 0x05, 0x6c, 0x6f, 0x63, 0x61, 0x6c, 0x00,
        0x00, 0x0c, 0x00, 0x01, 0x00, 0x00, 0x11, 0x94, 0x00, 0x07, 0x04, 0x54, 0x65, 0x73, 0x74,
        0xc0, 0x0c,
    ];

    #[test]
    fn should_read_registration_ptr_packet() {
        let buffer = PacketBuffer::new(PTR_RESPONSE.to_vec());
        let packet = Packet::try_from(buffer).unwrap();

        assert!(packet.header.response);
        assert!(packet.header.authoritative);
        assert!(packet.is_answer());
        assert!(packet.is_valid());

        assert_eq!(packet.answers.len(), 1);
        let answer = &packet.answers[0];
        assert_eq!(answer.name, "_test._tcp.local.");
        assert_eq!(answer.ttl, 4500);
        assert!(!answer.cache_flush);
        match &answer.rdata {
            RData::PTR { target } => assert_eq!(target, "Test._test._tcp.local."),
            other => panic!("expected PTR, got {other:?}"),
        }
    }

    #[test]
    fn should_write_registration_ptr_packet() {
        let mut packet =
            Packet::response().with_answer(Record::ptr("_test._tcp.local.", "Test._test._tcp.local."));
        let buffer = packet.create_buffer().unwrap();
        assert_eq!(buffer.filled(), PTR_RESPONSE);
    }

    #[test]
    fn should_round_trip_a_probe_packet() {
        use crate::packet::question::Question;
        use std::net::Ipv4Addr;

        let mut probe = Packet::query()
            .with_question(
                Question::new("host.local.", QueryType::ANY).with_unicast_response(true),
            )
            .with_authority(Record::a("host.local.", Ipv4Addr::new(169, 254, 20, 4)))
            .with_authority(Record::srv("Test._test._tcp.local.", "host.local.", 4444));

        let buffer = probe.create_buffer().unwrap();
        let parsed = Packet::try_from(PacketBuffer::new(buffer.filled().to_vec())).unwrap();
        assert_eq!(parsed, probe);
        assert!(parsed.is_probe());
        assert!(parsed.questions[0].unicast_response);
    }
}
