use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fleet_backup::model::{BackupType, Trigger};
use fleet_backup::registry::{AdmissionRequest, RunCompletion, RunRegistry};
use fleet_backup::remote::windows::parse_robocopy_summary;
use fleet_backup::scheduler::CronSchedule;

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");

    for active in [0usize, 64, 512] {
        let registry = RunRegistry::new(active + 1);
        for i in 0..active {
            registry
                .try_admit(AdmissionRequest::new(
                    format!("busy-{}", i),
                    BackupType::Full,
                    Trigger::Schedule("nightly".to_string()),
                ))
                .unwrap();
        }

        group.bench_with_input(BenchmarkId::new("admit_and_finish", active), &active, |b, _| {
            b.iter(|| {
                let run = registry
                    .try_admit(AdmissionRequest::new(
                        "bench-client",
                        BackupType::Incremental,
                        Trigger::Manual("bench".to_string()),
                    ))
                    .unwrap();
                registry.record_start(&run.id).unwrap();
                registry
                    .record_terminal(
                        &run.id,
                        RunCompletion::Failed {
                            error: "bench".to_string(),
                            partial_results: None,
                        },
                    )
                    .unwrap()
            });
        });

        if active > 0 {
            group.bench_with_input(BenchmarkId::new("reject_busy_client", active), &active, |b, _| {
                b.iter(|| {
                    black_box(registry.try_admit(AdmissionRequest::new(
                        "busy-0",
                        BackupType::Full,
                        Trigger::Manual("bench".to_string()),
                    )))
                });
            });
        }
    }

    group.finish();
}

fn bench_cron(c: &mut Criterion) {
    let nightly = CronSchedule::parse("0 2 * * *").unwrap();
    let weekdays = CronSchedule::parse("*/15 8-18 * * 1-5").unwrap();
    let at = Utc.with_ymd_and_hms(2024, 3, 11, 9, 45, 0).unwrap();

    c.bench_function("cron_is_due_nightly", |b| b.iter(|| nightly.is_due(black_box(at))));
    c.bench_function("cron_is_due_weekdays", |b| b.iter(|| weekdays.is_due(black_box(at))));
    c.bench_function("cron_parse", |b| {
        b.iter(|| CronSchedule::parse(black_box("30 3 * * 0")).unwrap())
    });
}

fn bench_robocopy_summary(c: &mut Criterion) {
    let output = "\
-------------------------------------------------------------------------------
               Total    Copied   Skipped  Mismatch    FAILED    Extras
    Dirs :       412        12       400         0         0         0
   Files :      9120       311      8809         0         0         0
   Bytes : 734003200  52428800 681574400         0         0         0
";
    c.bench_function("parse_robocopy_summary", |b| {
        b.iter(|| parse_robocopy_summary(black_box(output)))
    });
}

criterion_group!(benches, bench_admission, bench_cron, bench_robocopy_summary);
criterion_main!(benches);
