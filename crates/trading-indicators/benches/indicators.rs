//! Benchmarks for indicator implementations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trading_core::traits::{Indicator, StreamingIndicator};
use trading_core::types::Candle;
use trading_indicators::{relative_volume, vwap, Atr, Ema, Sma, StreamingEma, VolumeStats};

fn generate_test_data(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 100.0 + (i as f64 * 0.1).sin() * 10.0)
        .collect()
}

fn generate_candles(size: usize) -> Vec<Candle> {
    generate_test_data(size)
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let volume = 10.0 + (i % 7) as f64;
            Candle::new(i as i64 * 60_000, close - 0.5, close + 1.0, close - 1.0, close, volume)
        })
        .collect()
}

fn benchmark_moving_averages(c: &mut Criterion) {
    let mut group = c.benchmark_group("moving_average");

    for size in [1000, 10000, 100000].iter() {
        let data = generate_test_data(*size);

        group.bench_with_input(BenchmarkId::new("sma", size), &data, |b, data| {
            let sma = Sma::new(20);
            b.iter(|| sma.calculate(black_box(data)))
        });

        group.bench_with_input(BenchmarkId::new("ema", size), &data, |b, data| {
            let ema = Ema::new(20);
            b.iter(|| ema.calculate(black_box(data)))
        });

        group.bench_with_input(BenchmarkId::new("streaming_ema", size), &data, |b, data| {
            b.iter(|| {
                let mut ema = StreamingEma::new(20);
                for &value in data {
                    black_box(ema.update(value));
                }
            })
        });
    }

    group.finish();
}

fn benchmark_candle_analytics(c: &mut Criterion) {
    let mut group = c.benchmark_group("candle_analytics");

    for size in [1000, 10000, 100000].iter() {
        let candles = generate_candles(*size);

        group.bench_with_input(BenchmarkId::new("atr", size), &candles, |b, candles| {
            let atr = Atr::new(14);
            b.iter(|| atr.calculate_candles(black_box(candles)))
        });

        group.bench_with_input(BenchmarkId::new("vwap", size), &candles, |b, candles| {
            b.iter(|| vwap(black_box(candles)))
        });

        group.bench_with_input(BenchmarkId::new("relative_volume", size), &candles, |b, candles| {
            b.iter(|| relative_volume(black_box(candles), 20))
        });

        group.bench_with_input(BenchmarkId::new("volume_stats", size), &candles, |b, candles| {
            b.iter(|| VolumeStats::from_candles(black_box(candles)))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_moving_averages, benchmark_candle_analytics);
criterion_main!(benches);
