//! Benchmark suite for the output formatters.
//!
//! Isolates formatter performance from async runtime overhead to enable
//! precise measurement and optimization of the formatting logic.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use ruuvitag_collector::sink::influxdb::InfluxDbFormatter;
use ruuvitag_collector::sink::json::JsonFormatter;
use ruuvitag_collector::{Measurement, OutputFormatter, PeripheralAddress};
use std::time::SystemTime;

fn measurement(name: &str) -> Measurement {
    Measurement {
        address: PeripheralAddress::new("aa:bb:cc:dd:ee:ff"),
        name: name.to_string(),
        timestamp: SystemTime::UNIX_EPOCH,
        temperature: 24.30,
        humidity: 53.5,
        pressure: 1000.44,
        battery: 2977,
        dew_point: None,
        acceleration: (4, -4, 1036),
    }
}

/// Benchmark both formatters on the same measurement
fn bench_formatters(c: &mut Criterion) {
    let mut group = c.benchmark_group("format");
    group.throughput(Throughput::Elements(1));

    let m = measurement("Living Room");
    let influx = InfluxDbFormatter::new("ruuvi_measurement");
    group.bench_function("influx", |b| {
        b.iter(|| black_box(influx.format(black_box(&m))))
    });

    group.bench_function("json", |b| {
        b.iter(|| black_box(JsonFormatter.format(black_box(&m))))
    });

    group.finish();
}

/// Influx tag escaping and the address fallback for unnamed tags
fn bench_influx_names(c: &mut Criterion) {
    let mut group = c.benchmark_group("influx_name");
    group.throughput(Throughput::Elements(1));

    let formatter = InfluxDbFormatter::new("ruuvi_measurement");

    let unnamed = measurement("");
    group.bench_function("address_fallback", |b| {
        b.iter(|| black_box(formatter.format(black_box(&unnamed))))
    });

    let plain = measurement("Sauna");
    group.bench_function("plain", |b| {
        b.iter(|| black_box(formatter.format(black_box(&plain))))
    });

    let escaped = measurement("Living Room, north=wall");
    group.bench_function("escaped", |b| {
        b.iter(|| black_box(formatter.format(black_box(&escaped))))
    });

    group.finish();
}

criterion_group!(benches, bench_formatters, bench_influx_names);
criterion_main!(benches);
