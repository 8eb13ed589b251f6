#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;
use ndarray::{s, Array2, Array4, ArrayView1};
use prettytable::{format, row, Cell, Row};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use blockspn::leaf::IndicatorLeaf;
use blockspn::product::{BlockPermuteProduct, ProductOptions};
use blockspn::{BlockLayer, EvalPass, InferenceType, Input};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Evaluate an indicator leaf feeding a block permutation product, then recover each
/// variable's most probable state through the backward pass.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of variables (leaf scope slots)
    #[arg(long, default_value = "4")]
    vars: usize,

    /// Number of states per variable
    #[arg(long, default_value = "2")]
    components: usize,

    /// Number of adjacent scope slots combined by the product
    #[arg(long, short, default_value = "2")]
    factors: usize,

    /// Number of parallel decompositions
    #[arg(long, default_value = "1")]
    decomps: usize,

    /// Number of evidence rows
    #[arg(long, short, default_value = "4")]
    batch: usize,

    /// Probability that an evidence value is missing
    #[arg(long, default_value_t = 0.25)]
    missing: f64,

    /// Seed for sampling evidence
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.missing) {
        bail!("--missing must be within [0, 1], got {}", args.missing);
    }

    let leaf = Arc::new(IndicatorLeaf::new(args.vars, args.components, args.decomps));
    let product = BlockPermuteProduct::with_options(
        Input::Block(leaf.clone()),
        args.factors,
        ProductOptions::default().inference_type(InferenceType::Mpe),
    )?;
    info!("Product over {} has dims {}", leaf.dims(), product.dims());

    let evidence = sample_evidence(&args);
    let mut pass = EvalPass::<f64>::new();
    let leaf_value = Arc::new(leaf.compute_log_value::<f64>(evidence.view())?);
    let value = product.compute_value(&mut pass, &leaf_value)?;

    // Send one unit of credit per (scope, decomp, batch) slot to its best output node.
    let mut counts = Array4::<f64>::zeros(value.raw_dim());
    let (scopes, decomps, batch, _) = value.dim();
    for sc in 0..scopes {
        for d in 0..decomps {
            for b in 0..batch {
                let best = argmax(value.slice(s![sc, d, b, ..]));
                counts[[sc, d, b, best]] = 1.0;
            }
        }
    }
    let (leaf_counts,) = product.compute_log_mpe_path(counts.view(), Some(leaf_value.view()))?;
    let states = leaf.mpe_states(leaf_counts.view())?;

    print_table(&evidence, &states);
    info!(
        "Memo served {} of {} value queries",
        pass.hits(),
        pass.hits() + pass.misses()
    );
    Ok(())
}

fn sample_evidence(args: &Args) -> Array2<i64> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let components = i64::try_from(args.components).unwrap_or(i64::MAX);
    Array2::from_shape_simple_fn((args.batch, args.vars), || {
        if rng.gen_bool(args.missing) {
            -1
        } else {
            rng.gen_range(0..components.max(1))
        }
    })
}

fn argmax(values: ArrayView1<f64>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, best_value), (n, &v)| {
            if v > best_value {
                (n, v)
            } else {
                (best, best_value)
            }
        })
        .0
}

fn print_table(evidence: &Array2<i64>, states: &Array2<usize>) {
    let mut table = prettytable::Table::new();
    let mut titles = row!["Row"];
    for var in 0..evidence.ncols() {
        titles.add_cell(Cell::new(&format!("x{var}")));
    }
    table.set_titles(titles);
    for (b, (observed, inferred)) in evidence.outer_iter().zip(states.outer_iter()).enumerate() {
        let mut r = Row::new(vec![Cell::new(&b.to_string())]);
        for (&o, &i) in observed.iter().zip(inferred.iter()) {
            let text = if o < 0 {
                format!("? -> {i}")
            } else {
                i.to_string()
            };
            r.add_cell(Cell::new(&text));
        }
        table.add_row(r);
    }
    table.set_format(*format::consts::FORMAT_CLEAN);
    table.printstd();
}
