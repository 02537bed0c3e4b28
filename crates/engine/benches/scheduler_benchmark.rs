//! Scheduler throughput benchmarks
//!
//! Pushes frames through the reference runtime at several batch sizes and
//! measures the default frame conversion on its own.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use framebatch_common::{BackendOptions, FrameBatchError};
use framebatch_engine::runtime::{InputSpec, Operator, ReferenceManifest};
use framebatch_engine::tensor::convert::frame_to_tensor;
use framebatch_engine::tensor::{DataType, Layout, Tensor, TensorDesc};
use framebatch_engine::{ExecParams, Frame, Model, ModelFunction, PixelFormat, PollResult, ReferenceRuntime};
use std::io::Write;

const FRAMES: usize = 32;

fn manifest_file() -> tempfile::NamedTempFile {
    let manifest = ReferenceManifest {
        name: "bench".to_string(),
        inputs: vec![InputSpec {
            name: "x".to_string(),
            channels: 3,
            height: 32,
            width: 32,
            dtype: DataType::Float32,
        }],
        outputs: vec!["y".to_string()],
        operator: Operator::Identity,
        latency_us: 0,
    };
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(&manifest).unwrap().as_bytes())
        .unwrap();
    file
}

fn test_frame(seed: usize) -> Frame {
    let mut frame = Frame::new(32, 32, PixelFormat::Bgr24);
    for (i, p) in frame.data.iter_mut().enumerate() {
        *p = ((i + seed) % 251) as u8;
    }
    frame
}

/// Submit, flush and collect one round of frames
fn run_round(model: &mut Model<ReferenceRuntime>, frames: &[Frame]) -> usize {
    let mut submitted = 0;
    let mut ready = 0;
    while ready < frames.len() {
        if submitted < frames.len() {
            let params = ExecParams::new("x", "y", frames[submitted].clone())
                .with_output(Frame::new(32, 32, PixelFormat::Bgr24));
            match model.execute_async(params) {
                Ok(()) => submitted += 1,
                Err(FrameBatchError::ResourceExhausted(_)) => {}
                Err(e) => panic!("submission failed: {}", e),
            }
        } else {
            let _ = model.flush();
        }

        match model.poll_result() {
            PollResult::Ready { .. } | PollResult::Failed { .. } => ready += 1,
            PollResult::NotReady | PollResult::Empty => std::thread::yield_now(),
        }
    }
    ready
}

fn bench_async_throughput(c: &mut Criterion) {
    let file = manifest_file();
    let runtime = ReferenceRuntime::new(4).unwrap();
    let frames: Vec<Frame> = (0..FRAMES).map(test_frame).collect();

    let mut group = c.benchmark_group("async_throughput");
    group.throughput(Throughput::Elements(FRAMES as u64));

    for batch_size in [1usize, 4, 8] {
        let options = BackendOptions::builder()
            .nireq(4)
            .batch_size(batch_size)
            .build()
            .unwrap();
        let mut model = Model::load(&runtime, file.path(), ModelFunction::process_frame(), options).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &frames, |b, frames| {
            b.iter(|| black_box(run_round(&mut model, frames)))
        });
    }

    group.finish();
}

fn bench_frame_conversion(c: &mut Criterion) {
    let frame = test_frame(7);
    let mut tensor = Tensor::zeros(TensorDesc::new(1, 3, 64, 64, DataType::Float32).with_layout(Layout::Nhwc));

    c.bench_function("frame_to_tensor_64x64", |b| {
        b.iter(|| {
            let mut item = tensor.item_mut(0).unwrap();
            frame_to_tensor(black_box(&frame), &mut item).unwrap();
        })
    });
}

criterion_group!(benches, bench_async_throughput, bench_frame_conversion);
criterion_main!(benches);
