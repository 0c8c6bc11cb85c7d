use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mptcp_core::codec::{decode_option, encode_option, parse_options};
use mptcp_core::types::option::{DataAck, Dss, DssMapping, MptcpOption, SeqWidth};

fn create_test_dss() -> MptcpOption {
    MptcpOption::Dss(Dss {
        data_ack: Some(DataAck { value: 0x1_0000_0400, width: SeqWidth::Bits64 }),
        mapping: Some(DssMapping {
            data_seq: 0x8000_0000,
            width: SeqWidth::Bits32,
            subflow_seq: 1400,
            data_len: 1400,
            checksum: Some(0xBEEF),
        }),
        data_fin: false,
    })
}

fn bench_dss(c: &mut Criterion) {
    let option = create_test_dss();
    let mut group = c.benchmark_group("dss_option");

    group.bench_function("encode", |b| {
        let mut buf = BytesMut::with_capacity(40);
        b.iter(|| {
            buf.clear();
            encode_option(black_box(&option), &mut buf).unwrap();
        });
    });

    let mut encoded = BytesMut::new();
    encode_option(&option, &mut encoded).unwrap();

    group.bench_function("decode", |b| {
        b.iter(|| {
            let _ = black_box(decode_option(black_box(&encoded)).unwrap());
        });
    });

    group.bench_function("parse_option_list", |b| {
        let mut list = vec![1u8, 1, 8, 10, 0, 0, 0, 1, 0, 0, 0, 2];
        list.extend_from_slice(&encoded);
        b.iter(|| {
            let _ = black_box(parse_options(black_box(&list)));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dss);
criterion_main!(benches);
