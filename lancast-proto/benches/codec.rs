use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lancast_proto::buffer::PacketBuffer;
use lancast_proto::packet::record::{Record, TxtData, TxtEntry};
use lancast_proto::packet::Packet;
use std::net::Ipv4Addr;

fn announce_packet() -> Packet {
    let host = Record::a("host.local.", Ipv4Addr::new(169, 254, 20, 4));
    let srv = Record::srv("Unit._test._tcp.local.", "host.local.", 4444)
        .with_additionals(vec![host.clone()]);
    let txt = Record::txt(
        "Unit._test._tcp.local.",
        TxtData {
            entries: vec![TxtEntry::pair("path", "/status"), TxtEntry::flag("secure")],
        },
    );
    Packet::response()
        .with_answer(Record::ptr("_test._tcp.local.", "Unit._test._tcp.local."))
        .with_answer(srv)
        .with_answer(txt)
        .with_answer(host)
        .with_suggested_additionals()
}

fn encoding(mut packet: Packet) {
    let _buffer = packet.create_buffer().unwrap();
}

fn decoding(wire: Vec<u8>) {
    let _packet = Packet::try_from(PacketBuffer::new(wire)).unwrap();
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("encoding announce packet", |b| {
        let packet = announce_packet();
        b.iter(|| encoding(black_box(packet.clone())))
    });
    c.bench_function("decoding announce packet", |b| {
        let wire = announce_packet().create_buffer().unwrap().filled().to_vec();
        b.iter(|| decoding(black_box(wire.clone())))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
