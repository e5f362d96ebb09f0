use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hyper::Uri;
use trafficrec::config::RecordingFormat;
use trafficrec::exchange::{Exchange, InterceptedRequest, InterceptedResponse};
use trafficrec::naming::default_file_name;
use trafficrec::storage::{encode, parse_http_message, parse_mocktail};

fn exchange(size: usize, is_base64: bool) -> Exchange {
    let content_type = if is_base64 {
        "application/octet-stream"
    } else {
        "application/json"
    };

    Exchange {
        request: InterceptedRequest::new("GET", Uri::from_static("http://example.com/api/items?page=3")),
        response: InterceptedResponse::new(
            200,
            vec![
                ("Content-Type".to_string(), content_type.to_string()),
                ("Cache-Control".to_string(), "no-cache".to_string()),
            ],
        ),
        body: Bytes::from(vec![b'x'; size]),
        is_base64,
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [1_024, 64 * 1_024, 1_024 * 1_024] {
        group.throughput(Throughput::Bytes(size as u64));

        for (label, format, is_base64) in [
            ("mocktail", RecordingFormat::Mocktail, false),
            ("mocktail_base64", RecordingFormat::Mocktail, true),
            ("http_message", RecordingFormat::HttpMessage, false),
            ("body_only", RecordingFormat::BodyOnly, false),
        ] {
            let exchange = exchange(size, is_base64);
            group.bench_with_input(BenchmarkId::new(label, size), &exchange, |b, exchange| {
                b.iter(|| encode(format, black_box(exchange), r"/api/items\?page=3$"));
            });
        }
    }

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    let size = 64 * 1_024;

    let mocktail = encode(RecordingFormat::Mocktail, &exchange(size, true), "/x$").unwrap_or_default();
    let message = encode(RecordingFormat::HttpMessage, &exchange(size, false), "").unwrap_or_default();

    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("mocktail_base64", |b| {
        b.iter(|| parse_mocktail(black_box(&mocktail)));
    });
    group.bench_function("http_message", |b| {
        b.iter(|| parse_http_message(black_box(&message)));
    });

    group.finish();
}

fn bench_default_name(c: &mut Criterion) {
    let request = InterceptedRequest::new(
        "GET",
        Uri::from_static("http://example.com/api/v2/users/42/orders?status=open&limit=50"),
    );

    c.bench_function("default_file_name", |b| {
        b.iter(|| default_file_name(black_box(&request), black_box(17), "tail"));
    });
}

criterion_group!(benches, bench_encode, bench_parse, bench_default_name);
criterion_main!(benches);
