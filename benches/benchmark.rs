use criterion::{black_box, criterion_group, criterion_main, Criterion};
use render_cache::{capture_filename_at, sanitize_cache_key, validate_url, Config, RenderRequest};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_render_request_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_request");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let request =
                RenderRequest::new("https://example.com/schedule", "group-101").force_refresh();
            black_box(request);
        });
    });

    group.finish();
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/schedule?group=101",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_cache_key_sanitization(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key_sanitization");
    configure_fast_group(&mut group);

    let test_keys = vec![
        "bakalavr_1-kurs_101-21",
        "Бакалавр/1 курс:101-21",
        "key with spaces and объём",
    ];

    group.bench_function("sanitize", |b| {
        b.iter(|| {
            for key in &test_keys {
                let sanitized = sanitize_cache_key(key);
                black_box(sanitized);
            }
        });
    });

    group.bench_function("filename", |b| {
        b.iter(|| {
            let name = capture_filename_at("Бакалавр_101", 1_700_000_000_000);
            black_box(name);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_render_request_creation,
    benchmark_url_validation,
    benchmark_cache_key_sanitization
);
criterion_main!(benches);
