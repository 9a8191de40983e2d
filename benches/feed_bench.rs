//! Feed Benchmarks - Per-Frame Hot Path
//!
//! Benchmarks the work done for every streaming frame and every polled
//! quote: decoding, top-of-book extraction, validation, and publishing.
//!
//! Run with: cargo bench --bench feed_bench

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal_macros::dec;

use price_collector::adapters::feeds::valr_auth::ValrSigner;
use price_collector::adapters::feeds::valr_protocol::SessionProtocol;
use price_collector::domain::quote::{FeedStateCell, Quote};

const BOOK: &str = r#"{"type":"AGGREGATED_ORDERBOOK_UPDATE","currencyPairSymbol":"USDTZAR","data":{"Asks":[{"side":"sell","quantity":"100","price":"17.11","currencyPair":"USDTZAR","orderCount":2},{"side":"sell","quantity":"50","price":"17.12","currencyPair":"USDTZAR","orderCount":1}],"Bids":[{"side":"buy","quantity":"80","price":"17.08","currencyPair":"USDTZAR","orderCount":3},{"side":"buy","quantity":"20","price":"17.07","currencyPair":"USDTZAR","orderCount":1}],"LastChange":1700000000000}}"#;

/// Benchmark decoding an order book frame into a quote.
fn bench_order_book_frame(c: &mut Criterion) {
    let mut protocol = SessionProtocol::new("USDTZAR");

    c.bench_function("valr_order_book_frame", |b| {
        b.iter(|| {
            let _action = protocol.on_text(black_box(BOOK));
        });
    });
}

/// Benchmark sign normalization plus floor check.
fn bench_quote_validation(c: &mut Criterion) {
    let raw = Quote::new(dec!(-17.10), dec!(17.12));

    c.bench_function("quote_normalize_validate", |b| {
        b.iter(|| {
            let quote = black_box(raw).normalized();
            let _ok = quote.is_sane(black_box(dec!(2)));
        });
    });
}

/// Benchmark publishing a quote through the feed state cell.
fn bench_state_publish(c: &mut Criterion) {
    let cell = FeedStateCell::new();
    let _rx = cell.subscribe();
    let quote = Quote::new(dec!(17.08), dec!(17.11));
    let now = Utc::now();

    c.bench_function("feed_state_publish_read", |b| {
        b.iter(|| {
            cell.set_quote(black_box(quote), now);
            let _state = cell.snapshot();
        });
    });
}

/// Benchmark the auth signature computed on every connect.
fn bench_sign(c: &mut Criterion) {
    let signer = ValrSigner::new("key", "4961b74efac86b25cce8fbe4c9811c4c7a787b7a5996660afcc2e287ad864363");

    c.bench_function("valr_hmac_sha512_sign", |b| {
        b.iter(|| {
            let _sig = signer.sign(black_box(1_558_014_486_185), "GET", "/ws/trade", "");
        });
    });
}

criterion_group!(
    benches,
    bench_order_book_frame,
    bench_quote_validation,
    bench_state_publish,
    bench_sign,
);
criterion_main!(benches);
