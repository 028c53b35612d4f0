use std::hint::black_box;
use bencher::{TestCase, LARGE_RESPONSE_HEAD, SMALL_RESPONSE_HEAD};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rv_http::codec::HeadDecoder;
use rv_http::protocol::ResponseHead;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

fn create_test_cases() -> Vec<TestCase> {
    vec![TestCase::normal("small_header_decoder", SMALL_RESPONSE_HEAD), TestCase::normal("large_header_decoder", LARGE_RESPONSE_HEAD)]
}

fn benchmark_response_decoder(criterion: &mut Criterion) {
    let test_cases = create_test_cases();
    let mut group = criterion.benchmark_group("response_head_decoder");

    for case in test_cases {
        group.throughput(Throughput::Bytes(case.input().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(case.name()), &case, |b, case| {
            let mut decoder = HeadDecoder::<ResponseHead>::new();
            b.iter_batched_ref(
                || BytesMut::from(case.input()),
                |bytes_mut| {
                    let head = decoder.decode(bytes_mut).expect("input should be a valid http response head").unwrap();
                    black_box(head);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(decoder, benchmark_response_decoder);
criterion_main!(decoder);
