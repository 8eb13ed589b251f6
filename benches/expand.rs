use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use ndarray::Array4;
use std::hint::black_box;

use blockspn::block::BlockDims;
use blockspn::dims::FactorGeometry;
use blockspn::expand::expand_log_product;
use blockspn::reduce::reduce_counts;

const BATCH: usize = 32;

fn geometry() -> FactorGeometry {
    let child = BlockDims {
        scope: 16,
        decomps: 4,
        nodes: 8,
    };
    FactorGeometry::derive(child, 2).unwrap()
}

#[library_benchmark]
fn expand_two_factors() {
    let geom = geometry();
    let child = Array4::<f32>::from_shape_fn((16, 4, BATCH, 8), |(s, d, b, n)| {
        -((s + d + b + n) as f32)
    });
    black_box(expand_log_product(&geom, black_box(child.view())).unwrap());
}

#[library_benchmark]
fn reduce_two_factors() {
    let geom = geometry();
    let counts = Array4::<f32>::ones((8, 4, BATCH, 64));
    black_box(reduce_counts(&geom, black_box(counts.view())).unwrap());
}

library_benchmark_group!(
    name = block_product_group;
    benchmarks = expand_two_factors, reduce_two_factors
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = block_product_group
);
