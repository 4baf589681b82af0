use closure_trampolines::{
    Config, HeapPageMapper, HostTemplate, OsPageMapper, RetentionPolicy, TrampolineAllocator,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Trampolines");
    group.bench_function("acquire/release host", |b| {
        let alloc = TrampolineAllocator::host().unwrap();

        b.iter(|| {
            let t = alloc.acquire_closure_trampoline().unwrap();
            alloc.release_closure_trampoline(black_box(t).code());
        });
    });
    group.bench_function("acquire/release host, release immediately", |b| {
        let alloc = TrampolineAllocator::with_config(
            OsPageMapper::new(),
            HostTemplate::new().unwrap(),
            Config::new().retention(RetentionPolicy::ReleaseImmediately),
        )
        .unwrap();

        b.iter(|| {
            let t = alloc.acquire_closure_trampoline().unwrap();
            alloc.release_closure_trampoline(black_box(t).code());
        });
    });
    group.bench_function("fill and drain 1024 heap", |b| {
        let alloc = TrampolineAllocator::new(
            HeapPageMapper::new(closure_trampolines::host_page_size()),
            HostTemplate::new().unwrap(),
        )
        .unwrap();

        b.iter(|| {
            let held: Vec<_> = (0..1024)
                .map(|_| alloc.acquire_closure_trampoline().unwrap())
                .collect();
            for t in held {
                alloc.release_closure_trampoline(black_box(t).code());
            }
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
