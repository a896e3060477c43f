// Block codec and merkle benchmarks.
//
// Covers streamed block decoding at several transaction counts, merkle
// root computation, and per-transaction branch extraction.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use mapi_gateway::chain::{read_block, CodecError, RawBlock, RawTx};
use mapi_gateway::crypto::{merkle_branch, merkle_root, Hash256};

fn sample_block(tx_count: usize) -> RawBlock {
    let coinbase = RawTx::coinbase(1);
    let mut txs = vec![coinbase.clone()];
    for i in 1..tx_count {
        txs.push(RawTx::spending(&[coinbase.outpoint(0)], i as u32));
    }
    RawBlock::new(Hash256::ZERO, 1_700_000_000, txs)
}

fn bench_read_block(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("codec/read_block");

    for &count in &[100usize, 1_000, 10_000] {
        let block = sample_block(count);
        let bytes = block.serialize();
        let hash = block.hash();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &bytes, |b, bytes| {
            let data: &[u8] = bytes.as_slice();
            b.to_async(&runtime).iter(move || async move {
                read_block(data, Some(&hash), u64::MAX, |_, _, _| Ok::<(), CodecError>(()))
                    .await
                    .expect("valid block")
            });
        });
    }
    group.finish();
}

fn bench_merkle(c: &mut Criterion) {
    let leaves: Vec<Hash256> = (0..10_000u32).map(|i| Hash256::digest(&i.to_le_bytes())).collect();

    c.bench_function("merkle/root_10k", |b| {
        b.iter(|| merkle_root(&leaves));
    });
    c.bench_function("merkle/branch_10k", |b| {
        b.iter(|| merkle_branch(&leaves, 4_321));
    });
}

criterion_group!(benches, bench_read_block, bench_merkle);
criterion_main!(benches);
