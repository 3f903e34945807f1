use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use vantage::config::Settings;
use vantage::datatype::{self, Value, ValueType};
use vantage::session::Session;

fn codec(c: &mut Criterion) {
    let text = Value::String("observation ".repeat(8));
    c.bench_function("encode decode Double", |b| {
        b.iter(|| {
            let bytes = datatype::encode(ValueType::Double, black_box(&Value::Double(0.1))).unwrap();
            datatype::decode(&bytes, ValueType::Double).unwrap()
        })
    });
    c.bench_function("encode decode String", |b| {
        b.iter(|| {
            let bytes = datatype::encode(ValueType::String, black_box(&text)).unwrap();
            datatype::decode(&bytes, ValueType::String).unwrap()
        })
    });
}

fn pack(c: &mut Criterion) {
    let session = Session::local(&Settings::default()).unwrap();
    let names: Vec<String> = (0..64).map(|i| format!("channel_{i}")).collect();
    c.bench_function("pack 64 names", |b| {
        b.iter(|| {
            for (i, name) in names.iter().enumerate() {
                session.pack(name, ValueType::Integer64, black_box(i as i64)).unwrap();
            }
        })
    });
    c.bench_function("pack and publish 64 names", |b| {
        b.iter(|| {
            for (i, name) in names.iter().enumerate() {
                session.pack(name, ValueType::Integer64, black_box(i as i64)).unwrap();
            }
            session.publish().unwrap()
        })
    });
    session.finalize().unwrap();
}

criterion_group!(benches, codec, pack);
criterion_main!(benches);
