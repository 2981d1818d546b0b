//! Benchmarks for trade aggregation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trading_core::types::{Side, Timeframe, Trade};
use trading_data::{CandleAggregator, MarketAggregator};

fn generate_trades(size: usize) -> Vec<Trade> {
    (0..size)
        .map(|i| {
            let price = 100.0 + (i as f64 * 0.01).sin();
            let side = if i % 3 == 0 { Side::Sell } else { Side::Buy };
            Trade::new("BTCUSDT", price, 0.01 + (i % 5) as f64 * 0.01, side, i as i64 * 250)
        })
        .collect()
}

fn benchmark_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    for size in [10_000, 100_000].iter() {
        let trades = generate_trades(*size);

        group.bench_with_input(BenchmarkId::new("single_timeframe", size), &trades, |b, trades| {
            b.iter(|| {
                let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::Minute1);
                for trade in trades {
                    black_box(agg.push_trade(trade));
                }
            })
        });

        group.bench_with_input(BenchmarkId::new("fan_out", size), &trades, |b, trades| {
            b.iter(|| {
                let mut market = MarketAggregator::new(
                    [Timeframe::Minute1, Timeframe::Minute5, Timeframe::Hour1],
                    true,
                );
                for trade in trades {
                    black_box(market.push_trade(trade));
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_aggregation);
criterion_main!(benches);
