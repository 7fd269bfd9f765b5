use cosmos_forge::budget::{
    BudgetConfig, ContentExtractor, ContextBudgetAllocator, FileCandidate, Priority,
    TokenEstimator,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::path::{Path, PathBuf};

fn synthetic_source(functions: usize) -> String {
    (0..functions)
        .map(|i| {
            format!(
                "export function handler{i}(req: Request, ctx: Context): Response {{\n  const value = ctx.lookup(req.id, {i});\n  if (!value) {{\n    return notFound();\n  }}\n  return json(value);\n}}\n\n"
            )
        })
        .collect()
}

fn synthetic_repo(file_count: usize) -> (tempfile::TempDir, Vec<FileCandidate>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut candidates = Vec::with_capacity(file_count);
    for i in 0..file_count {
        let rel = PathBuf::from(format!("src/feature_{:02}/file_{:03}.ts", i % 12, i));
        let abs = dir.path().join(&rel);
        std::fs::create_dir_all(abs.parent().expect("parent")).expect("mkdir");
        std::fs::write(&abs, synthetic_source(40 + (i % 7) * 30)).expect("write");
        let priority = match i % 3 {
            0 => Priority::High,
            1 => Priority::Medium,
            _ => Priority::Low,
        };
        candidates.push(if i == 0 {
            FileCandidate::edit_target(rel, priority)
        } else {
            FileCandidate::reference(rel, priority)
        });
    }
    (dir, candidates)
}

fn bench_allocate(c: &mut Criterion) {
    let (dir, candidates) = synthetic_repo(60);
    let allocator = ContextBudgetAllocator::new(dir.path(), BudgetConfig::default());
    c.bench_function("allocate_60_files_40k", |b| {
        b.iter(|| {
            let plan = allocator
                .allocate(black_box(&candidates), black_box(40_000))
                .expect("plan");
            black_box(plan.allocated_tokens());
        });
    });
}

fn bench_extract(c: &mut Criterion) {
    let source = synthetic_source(300);
    let path = Path::new("src/handlers.ts");
    let extractor = ContentExtractor;

    c.bench_function("estimate_tokens", |b| {
        b.iter(|| black_box(TokenEstimator::estimate(Some(path), black_box(&source))));
    });
    c.bench_function("extract_signatures", |b| {
        b.iter(|| black_box(extractor.signatures(path, black_box(&source)).tokens));
    });
    c.bench_function("extract_truncated_2k", |b| {
        b.iter(|| black_box(extractor.truncated(path, black_box(&source), 2_000)));
    });
}

criterion_group!(benches, bench_allocate, bench_extract);
criterion_main!(benches);
