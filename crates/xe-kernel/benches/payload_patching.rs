//! Criterion benchmarks for argument binding and group-size patching, the
//! per-enqueue CPU cost in front of every dispatch.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use xe_common::HwInfo;
use xe_common::config::{KernelConfig, SvmModeOverride};
use xe_kernel::{DeviceResources, KernelDescriptor, Module};
use xe_memory::{MemoryManager, SvmAllocationProperties, SvmAllocsManager, SvmCapabilities};

fn resources() -> DeviceResources {
    let mm = Arc::new(MemoryManager::new(1, 0));
    let svm = Arc::new(SvmAllocsManager::new(
        Arc::clone(&mm),
        SvmCapabilities::default(),
        SvmModeOverride::Auto,
    ));
    DeviceResources::new(0, HwInfo::default(), KernelConfig::default(), mm, svm)
}

fn bench_set_args(c: &mut Criterion) {
    let res = resources();
    let mut group = c.benchmark_group("set_arg_buffer");
    for args in [1usize, 4, 16] {
        let mut builder = KernelDescriptor::builder("k", 16).dispatch_traits();
        for _ in 0..args {
            builder = builder.bindful_pointer_arg();
        }
        let module = Module::new(res.clone(), vec![builder.build()]).expect("module");
        let mut kernel = module.create_kernel("k").expect("kernel");
        let pointers: Vec<u64> = (0..args)
            .map(|_| {
                res.svm
                    .create_device_alloc(64 * 1024, &SvmAllocationProperties::default(), 0)
                    .expect("device alloc")
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(args), &pointers, |b, pointers| {
            b.iter(|| {
                for (index, &ptr) in pointers.iter().enumerate() {
                    kernel.set_arg_buffer(index, Some(black_box(ptr))).expect("bind");
                }
            });
        });
        drop(kernel);
        for ptr in pointers {
            res.svm.free(ptr, true).expect("free");
        }
    }
    group.finish();
}

fn bench_group_size(c: &mut Criterion) {
    let res = resources();
    let module = Module::new(
        res,
        vec![KernelDescriptor::builder("ids", 16).dispatch_traits().local_ids(3).build()],
    )
    .expect("module");
    let mut kernel = module.create_kernel("ids").expect("kernel");
    let mut group = c.benchmark_group("set_group_size");
    for size in [[16u32, 1, 1], [64, 4, 1], [512, 1, 1]] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}x{}", size[0], size[1], size[2])),
            &size,
            |b, &size| {
                b.iter(|| {
                    // Alternate so local IDs are regenerated every iteration.
                    kernel.set_group_size(black_box([1, 1, 1])).expect("reset");
                    kernel.set_group_size(black_box(size)).expect("size");
                });
            },
        );
    }
    group.finish();
}

fn bench_dispatch_state(c: &mut Criterion) {
    let res = resources();
    let module = Module::new(
        res,
        vec![
            KernelDescriptor::builder("k", 32)
                .dispatch_traits()
                .bindful_pointer_arg()
                .value_arg(16)
                .local_ids(1)
                .build(),
        ],
    )
    .expect("module");
    let mut kernel = module.create_kernel("k").expect("kernel");
    kernel.set_group_size([256, 1, 1]).expect("size");
    c.bench_function("dispatch_state", |b| b.iter(|| black_box(kernel.dispatch_state())));
}

criterion_group!(benches, bench_set_args, bench_group_size, bench_dispatch_state);
criterion_main!(benches);
