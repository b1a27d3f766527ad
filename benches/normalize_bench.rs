// Benchmark for the per-frame hot path: parse, merge, detect, normalize.
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use creality_ws::detector::{PrinterFamily, detect};
use creality_ws::normalizer::{DeviceState, normalize};
use creality_ws::telemetry::{Frame, TelemetrySnapshot, parse_frame};
use serde_json::json;
use std::hint::black_box;

fn full_frame() -> String {
    let objects: Vec<_> = (0..40).map(|i| json!({"name": format!("part_{i}")})).collect();
    json!({
        "model": "K1C",
        "modelVersion": "printer hw ver:CR4CU220812S11;printer sw ver:1.3.3.5;DWIN hw ver:;DWIN sw ver:;",
        "hostname": "K1C-2B3D",
        "state": 1,
        "printFileName": "benchy.gcode",
        "printProgress": 37,
        "printLeftTime": 2710,
        "printJobTime": 1580,
        "layer": 52,
        "TotalLayer": 140,
        "nozzleTemp": "219.870000",
        "targetNozzleTemp": 220,
        "bedTemp0": "59.990000",
        "targetBedTemp0": 60,
        "boxTemp": 34,
        "curPosition": "X:110.52 Y:98.03 Z:10.60",
        "curFeedratePct": 100,
        "curFlowratePct": 100,
        "modelFanPct": 100,
        "caseFanPct": 40,
        "auxiliaryFanPct": 0,
        "lightSw": 1,
        "objects": serde_json::to_string(&objects).unwrap(),
        "err": {"errcode": 0, "key": 0},
        "usedMaterialLength": 5321.4,
        "realTimeFlow": 4.2
    })
    .to_string()
}

fn bench_frame_pipeline(c: &mut Criterion) {
    let text = full_frame();
    let features = PrinterFamily::K1C.features();

    c.bench_function("parse full frame", |b| {
        b.iter(|| {
            let frame = parse_frame(black_box(&text)).unwrap();
            assert!(matches!(frame, Frame::Snapshot(_)));
        });
    });

    let Ok(Frame::Snapshot(snapshot)) = parse_frame(&text) else {
        panic!("benchmark frame must parse");
    };
    c.bench_function("merge + normalize full frame", |b| {
        b.iter(|| {
            let mut accumulated = TelemetrySnapshot::new();
            accumulated.merge(black_box(&snapshot));
            let state: DeviceState = normalize(&accumulated, &features, None);
            assert_eq!(state.object_count, 40);
        });
    });

    c.bench_function("detect family", |b| {
        b.iter(|| {
            let detection = detect(black_box(&snapshot), None);
            assert_eq!(detection.family, PrinterFamily::K1C);
        });
    });

    let delta = json!({"nozzleTemp": 220.1, "printProgress": 38}).to_string();
    c.bench_function("parse + merge + normalize delta", |b| {
        let mut accumulated = snapshot.clone();
        b.iter(|| {
            if let Ok(Frame::Snapshot(frame)) = parse_frame(black_box(&delta)) {
                accumulated.merge(&frame);
            }
            black_box(normalize(&accumulated, &features, None));
        });
    });
}

criterion_group!(benches, bench_frame_pipeline);
criterion_main!(benches);
