use criterion::{black_box, criterion_group, criterion_main, Criterion};
use editorsync::codec::{self, Operation};
use editorsync::position::{offset_to_position, position_to_offset, shift_offset};
use editorsync::protocol::Envelope;

/// ~10 KB of prose-like text with one line per sentence.
fn document() -> String {
    (0..200)
        .map(|i| format!("Line {i}: the quick brown fox jumps over the lazy dog.\n"))
        .collect()
}

fn edited(doc: &str) -> String {
    let mut out = doc.replacen("Line 100:", "Line one hundred:", 1);
    out.insert_str(0, "Title\n\n");
    out.push_str("The end.\n");
    out
}

fn bench_diff_10kb(c: &mut Criterion) {
    let before = document();
    let after = edited(&before);

    c.bench_function("diff_10KB_three_edits", |b| {
        b.iter(|| black_box(codec::diff(black_box(&before), black_box(&after))))
    });
}

fn bench_apply_10kb(c: &mut Criterion) {
    let before = document();
    let patch = codec::diff(&before, &edited(&before));

    c.bench_function("apply_10KB_three_edits", |b| {
        b.iter(|| black_box(codec::apply(black_box(&patch), black_box(&before))))
    });
}

fn bench_to_operations(c: &mut Criterion) {
    let before = document();
    let patch = codec::diff(&before, &edited(&before));

    c.bench_function("patch_to_operations", |b| {
        b.iter(|| black_box(patch.to_operations().unwrap()))
    });
}

fn bench_hash_10kb(c: &mut Criterion) {
    let doc = document();
    c.bench_function("crc32_hash_10KB", |b| b.iter(|| black_box(codec::hash(black_box(&doc)))));
}

fn bench_keystroke_patch(c: &mut Criterion) {
    let before = document();
    let mut after = before.clone();
    after.insert(5000, 'x');

    c.bench_function("keystroke_diff_and_encode", |b| {
        b.iter(|| {
            let patch = codec::diff(black_box(&before), black_box(&after));
            black_box(Envelope::patch(&patch).encode().unwrap());
        })
    });
}

fn bench_position_mapping(c: &mut Criterion) {
    let doc = document();
    let pos = offset_to_position(&doc, 9000);

    c.bench_function("offset_to_position_9000", |b| {
        b.iter(|| black_box(offset_to_position(black_box(&doc), black_box(9000))))
    });
    c.bench_function("position_to_offset", |b| {
        b.iter(|| black_box(position_to_offset(black_box(&doc), black_box(pos))))
    });
}

fn bench_shift_offset_100_ops(c: &mut Criterion) {
    let ops: Vec<Operation> = (0..100)
        .map(|i| {
            if i % 2 == 0 {
                Operation::insert("ab", i * 10)
            } else {
                Operation::remove("c", i * 10)
            }
        })
        .collect();

    c.bench_function("shift_offset_100_ops", |b| {
        b.iter(|| black_box(shift_offset(black_box(5000), black_box(&ops))))
    });
}

criterion_group!(
    benches,
    bench_diff_10kb,
    bench_apply_10kb,
    bench_to_operations,
    bench_hash_10kb,
    bench_keystroke_patch,
    bench_position_mapping,
    bench_shift_offset_100_ops,
);
criterion_main!(benches);
