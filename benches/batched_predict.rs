use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use fedgwas::accel::{Accelerator, WorkerPool};
use fedgwas::regress::BatchedLinearRegression;
use ndarray::{Array2, Array3};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NSAMPLE: usize = 500;
const NDIMS: usize = 4;

fn random_batch(batch: usize) -> (Array3<f64>, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(0xFED6 + batch as u64);
    let x = Array3::from_shape_fn((batch, NSAMPLE, NDIMS), |(_, _, j)| {
        if j == 0 { 1.0 } else { rng.gen_range(0..3) as f64 }
    });
    let beta = Array2::from_shape_fn((batch, NDIMS), |_| rng.sample(Standard));
    (x, beta)
}

fn benchmark_batched_predict(c: &mut Criterion) {
    // 1021 leaves a remainder for every pool size, so the single-path tail is measured too.
    let batches = [256_usize, 1021];
    let parallel = match WorkerPool::with_available_cores() {
        Ok(pool) => Accelerator::Parallel(pool),
        Err(e) => {
            eprintln!("Skipping parallel benchmarks: {e}");
            Accelerator::Single
        }
    };

    let mut group = c.benchmark_group("batched_predict");
    for &batch in &batches {
        let (x, beta) = random_batch(batch);
        let model = BatchedLinearRegression::from_coefficients(beta, false);
        group.throughput(Throughput::Elements((batch * NSAMPLE) as u64));

        group.bench_with_input(BenchmarkId::new("single", batch), &x, |b, input| {
            b.iter(|| {
                let predicted = model.predict(black_box(input.view()), &Accelerator::Single);
                black_box(predicted);
            });
        });

        group.bench_with_input(BenchmarkId::new("parallel", batch), &x, |b, input| {
            b.iter(|| {
                let predicted = model.predict(black_box(input.view()), &parallel);
                black_box(predicted);
            });
        });
    }
    group.finish();
}

criterion_group!(batched_predict, benchmark_batched_predict);
criterion_main!(batched_predict);
