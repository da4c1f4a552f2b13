use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dns_racer::protocol::{Answer, AnswerData, Query};
use std::net::Ipv4Addr;

fn decode_query(c: &mut Criterion) {
    let packet = Query::new(0x1234, "www.example.com").to_bytes().unwrap();

    c.bench_function("decode query", |b| {
        b.iter(|| Query::from_bytes(black_box(&packet)))
    });
}

fn encode_answers(c: &mut Criterion) {
    let a = Answer {
        id: 0x1234,
        name: "nas.lan".to_string(),
        data: AnswerData::A(Ipv4Addr::new(192, 168, 1, 10)),
    };
    let cname = Answer {
        id: 0x1234,
        name: "www.lan".to_string(),
        data: AnswerData::Cname("nas.lan".to_string()),
    };

    c.bench_function("encode A answer", |b| b.iter(|| black_box(&a).to_bytes()));
    c.bench_function("encode CNAME answer", |b| {
        b.iter(|| black_box(&cname).to_bytes())
    });
}

criterion_group!(benches, decode_query, encode_answers);
criterion_main!(benches);
