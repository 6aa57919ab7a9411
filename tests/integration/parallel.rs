//! Structured fork-join tests

use std::sync::atomic::{AtomicU64, Ordering};

use forkjoin_rts::backend::{Backend, TaskGroupBackend, Tasking};
use forkjoin_rts::parallel::{par_do, parallel_for};

type Omp = Tasking;

fn sort<B: Backend>(v: &mut [u32]) {
    if v.len() <= 16 {
        v.sort_unstable();
        return;
    }
    let mid = v.len() / 2;
    v.select_nth_unstable(mid);
    let (left, right) = v.split_at_mut(mid);
    par_do::<B, _, _, _, _>(|| sort::<B>(left), || sort::<B>(right)).unwrap();
}

fn sort_check<B: Backend>() {
    let mut v: Vec<u32> = (0..20_000u32).map(|i| i.wrapping_mul(2_654_435_761) % 10_007).collect();
    let mut expected = v.clone();
    expected.sort_unstable();
    B::with_workers(4, || sort::<B>(&mut v)).unwrap();
    assert_eq!(v, expected);
}

#[test]
fn test_parallel_sort_tasking() {
    sort_check::<Omp>();
}

#[test]
fn test_parallel_sort_task_group() {
    sort_check::<TaskGroupBackend>();
}

fn histogram<B: Backend>(buckets: &[AtomicU64]) {
    let n = buckets.len() as u64 * 100;
    B::with_workers(3, || {
        parallel_for::<B, u64, _>(0..n, None, &|i| {
            buckets[(i % buckets.len() as u64) as usize].fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    })
    .unwrap();
}

#[test]
fn test_parallel_for_histogram_agrees() {
    let a: Vec<AtomicU64> = (0..37).map(|_| AtomicU64::new(0)).collect();
    let b: Vec<AtomicU64> = (0..37).map(|_| AtomicU64::new(0)).collect();
    histogram::<Omp>(&a);
    histogram::<TaskGroupBackend>(&b);
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.load(Ordering::Relaxed), 100);
        assert_eq!(y.load(Ordering::Relaxed), 100);
    }
}

#[test]
fn test_parallel_for_narrow_extent() {
    let hits = AtomicU64::new(0);
    Omp::with_workers(2, || {
        parallel_for::<Omp, u8, _>(0..u8::MAX, None, &|_| {
            hits.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    })
    .unwrap();
    assert_eq!(hits.into_inner(), 255);
}
