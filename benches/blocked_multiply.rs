use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use damds::kernel::blocked_multiply;
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIM: usize = 3;

fn plain_multiply(a: &Array2<f64>, x: &[f64], out: &mut [f64]) {
    let (rows, inner) = a.dim();
    for i in 0..rows {
        for d in 0..DIM {
            out[i * DIM + d] = (0..inner).map(|k| a[[i, k]] * x[k * DIM + d]).sum();
        }
    }
}

fn random_rows(rows: usize, n: usize) -> (Array2<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(0x5EED_B0F2 + n as u64);
    let a = Array2::from_shape_fn((rows, n), |_| rng.sample(Standard));
    let x = (0..n * DIM).map(|_| rng.sample(Standard)).collect();
    (a, x)
}

fn benchmark_blocked_multiply(c: &mut Criterion) {
    let sizes = [256_usize, 1024, 2048];
    let inputs: Vec<_> = sizes.iter().map(|&n| (n, random_rows(n / 4, n))).collect();

    let mut group = c.benchmark_group("blocked_multiply");
    for (n, (a, x)) in inputs.iter() {
        let rows = a.nrows();
        group.throughput(Throughput::Elements((rows * n) as u64));
        let mut out = vec![0.0; rows * DIM];

        group.bench_with_input(BenchmarkId::new("plain", n), a, |b, input| {
            b.iter(|| {
                plain_multiply(black_box(input), black_box(x), &mut out);
                black_box(&out);
            });
        });

        for block_size in [16, 64, 256] {
            let id = BenchmarkId::new(format!("block {block_size}"), n);
            group.bench_with_input(id, a, |b, input| {
                b.iter(|| {
                    blocked_multiply(black_box(input.view()), black_box(x), DIM, block_size, &mut out);
                    black_box(&out);
                });
            });
        }
    }
    group.finish();
}

criterion_group!(blocked_multiply_group, benchmark_blocked_multiply);
criterion_main!(blocked_multiply_group);
