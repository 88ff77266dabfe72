mod common;

use std::io::Write;

use common::{captured_streams, no_packages, Workspace};
use exprec::edit::delete_run;
use exprec::events::{EventSink, RunEvent};
use exprec::images::latest_image;
use exprec::scalars::{read_series, ScalarWriter};
use exprec::store::load_record;
use exprec::{record, ExprecError, Failure, Interrupted, ParamValue, Run, RunStatus, StdStreams};
use futures_util::FutureExt;
use image::{DynamicImage, ImageBuffer, Rgb};
use proptest::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn run_folder_has_the_full_layout() {
    let ws = Workspace::new();
    let (streams, terminal_out, terminal_err) = captured_streams();
    let mut run = Run::start(ws.options("layout").title("baseline").tags(["cnn", "a", "cnn"]).verbose(true), streams)
        .await
        .unwrap();
    let paths = run.paths().clone();

    let rec = load_record(&paths.metadata()).await.unwrap();
    assert_eq!(rec.status, RunStatus::Running);
    assert_eq!(rec.name, "layout");
    assert_eq!(rec.tags, vec!["a", "cnn"]);
    assert!(rec.ended_datetime.is_none());
    assert_eq!(rec.pid, std::process::id());

    run.set_parameter("lr", 0.1).await.unwrap();
    run.set_parameter("lr", 0.01).await.unwrap();
    run.set_parameter("optimizer", "adam").await.unwrap();
    run.add_scalar("loss", 1.5, None).await.unwrap();
    run.add_scalar("loss", 0.5, None).await.unwrap();
    run.log("epoch 1 done").unwrap();
    writeln!(run.stderr(), "warning: slow batch").unwrap();

    let mut f = run.open_file("out/metrics.txt").await.unwrap();
    f.write_all(b"acc=0.9\n").await.unwrap();
    f.flush().await.unwrap();
    drop(f);

    let finished = run.finish(Ok(())).await.unwrap();
    assert_eq!(finished.status, RunStatus::Succeeded);
    drop(finished.streams);

    let rec = load_record(&paths.metadata()).await.unwrap();
    assert_eq!(rec.status, RunStatus::Succeeded);
    assert!(rec.ended_datetime.is_some());
    assert!(rec.exception_type.is_none());
    assert_eq!(rec.parameters["lr"], ParamValue::Float(0.01));
    assert_eq!(rec.parameters["optimizer"], ParamValue::Text("adam".into()));

    let stdout_log = std::fs::read_to_string(paths.stdout_log()).unwrap();
    let stderr_log = std::fs::read_to_string(paths.stderr_log()).unwrap();
    let combined = std::fs::read_to_string(paths.combined_log()).unwrap();
    assert_eq!(stdout_log, "epoch 1 done\n");
    assert_eq!(stderr_log, "warning: slow batch\n");
    assert_eq!(combined, "epoch 1 done\nwarning: slow batch\n");
    assert!(terminal_out.text().starts_with("Running experiment "));
    assert!(terminal_out.text().contains("(alias 'layout'): baseline"));
    assert!(terminal_out.text().ends_with("epoch 1 done\n"));
    assert_eq!(terminal_err.text(), "warning: slow batch\n");

    assert_eq!(std::fs::read_to_string(paths.packages()).unwrap(), "demo==0.1.0\nserde==1.0.0");
    assert!(paths.source().join("src/main.rs").is_file());
    assert!(paths.source().join("Cargo.toml").is_file());
    assert!(!paths.source().join(".secret").exists());
    assert!(!paths.source().join("notes.md").exists());
    assert!(!paths.source().join(".experiments").exists());

    assert_eq!(std::fs::read_to_string(paths.files().join("out/metrics.txt")).unwrap(), "acc=0.9\n");
    let loss = read_series(&paths.scalar_series("loss")).await.unwrap();
    assert_eq!(loss.iter().map(|p| p.value).collect::<Vec<_>>(), vec![1.5, 0.5]);
}

#[tokio::test]
async fn names_are_unique_while_the_holder_exists() {
    let ws = Workspace::new();
    let a = Run::start(no_packages(ws.options("exp1")), StdStreams::sink()).await.unwrap();
    let a_id = a.id_str().to_string();
    a.finish(Ok(())).await.unwrap();

    let clash = Run::start(no_packages(ws.options("exp1")), StdStreams::sink()).await;
    assert!(matches!(clash, Err(ExprecError::NameTaken(n)) if n == "exp1"));

    // Unnamed runs never clash.
    for _ in 0..2 {
        let r = Run::start(no_packages(ws.options("")), StdStreams::sink()).await.unwrap();
        r.finish(Ok(())).await.unwrap();
    }

    delete_run(&ws.root, &a_id).await.unwrap();
    let b = Run::start(no_packages(ws.options("exp1")), StdStreams::sink()).await.unwrap();
    assert_ne!(b.id_str(), a_id);
    b.finish(Ok(())).await.unwrap();
}

#[tokio::test]
async fn interrupt_ends_as_succeeded() {
    let ws = Workspace::new();
    let report = record(no_packages(ws.options("")), StdStreams::sink(), |run| {
        async move {
            run.add_scalar("loss", 1.0, Some(0)).await?;
            Err::<(), Failure>(Interrupted.into())
        }
        .boxed()
    })
    .await
    .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.value.is_none());
    let rec = load_record(&exprec::RunPaths::new(&ws.root, &report.id).metadata()).await.unwrap();
    assert_eq!(rec.status, RunStatus::Succeeded);
    assert!(rec.exception_type.is_none());
    assert!(rec.exception_value.is_none());
}

#[derive(Debug, thiserror::Error)]
#[error("loss diverged at step {0}")]
struct Diverged(u64);

#[tokio::test]
async fn other_failures_end_as_failed_with_exception_fields() {
    let ws = Workspace::new();
    let res = record(no_packages(ws.options("diverges")), StdStreams::sink(), |run| {
        async move {
            run.log("starting").map_err(Failure::from)?;
            Err::<(), Failure>(Diverged(12).into())
        }
        .boxed()
    })
    .await;

    let Err(ExprecError::RunFailed { run_id, kind, message }) = res else {
        panic!("expected RunFailed");
    };
    assert_eq!(kind, "Diverged");
    assert_eq!(message, "loss diverged at step 12");

    let paths = exprec::RunPaths::new(&ws.root, &run_id);
    let rec = load_record(&paths.metadata()).await.unwrap();
    assert_eq!(rec.status, RunStatus::Failed);
    assert_eq!(rec.exception_type.as_deref(), Some("Diverged"));
    assert_eq!(rec.exception_value.as_deref(), Some("loss diverged at step 12"));
    let stderr_log = std::fs::read_to_string(paths.stderr_log()).unwrap();
    assert_eq!(stderr_log, "Diverged: loss diverged at step 12\n");
}

#[tokio::test]
async fn non_fatal_set_is_configurable() {
    let ws = Workspace::new();
    let opts = no_packages(ws.options("")).non_fatal(["Diverged"]);
    let report = record(opts, StdStreams::sink(), |_run| async move { Err::<(), Failure>(Diverged(3).into()) }.boxed())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let opts = no_packages(ws.options("")).non_fatal(Vec::<String>::new());
    let res = record(opts, StdStreams::sink(), |_run| async move { Err::<(), Failure>(Interrupted.into()) }.boxed()).await;
    assert!(matches!(res, Err(ExprecError::RunFailed { kind, .. }) if kind == "Interrupted"));
}

#[tokio::test]
async fn body_value_is_returned() {
    let ws = Workspace::new();
    let report = record(no_packages(ws.options("")), StdStreams::sink(), |run| {
        async move {
            run.set_parameter("epochs", 3).await?;
            Ok::<u32, Failure>(42)
        }
        .boxed()
    })
    .await
    .unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.value, Some(42));
}

#[tokio::test]
async fn panic_is_recorded_then_resumed() {
    let ws = Workspace::new();
    let outcome = std::panic::AssertUnwindSafe(record(no_packages(ws.options("boom")), StdStreams::sink(), |_run| {
        async move {
            if true {
                panic!("exploded");
            }
            Ok::<(), Failure>(())
        }
        .boxed()
    }))
    .catch_unwind()
    .await;
    assert!(outcome.is_err());

    let ids = exprec::listing::list_run_ids(&ws.root).await.unwrap();
    assert_eq!(ids.len(), 1);
    let rec = load_record(&exprec::RunPaths::new(&ws.root, &ids[0]).metadata()).await.unwrap();
    assert_eq!(rec.status, RunStatus::Failed);
    assert_eq!(rec.exception_type.as_deref(), Some("Panic"));
    assert_eq!(rec.exception_value.as_deref(), Some("exploded"));
}

#[tokio::test]
async fn panic_survives_failed_bookkeeping() {
    let ws = Workspace::new();
    let outcome = std::panic::AssertUnwindSafe(record(no_packages(ws.options("")), StdStreams::sink(), |run| {
        let dir = run.paths().dir().to_path_buf();
        async move {
            std::fs::remove_dir_all(&dir).unwrap();
            if true {
                panic!("exploded after cleanup");
            }
            Ok::<(), Failure>(())
        }
        .boxed()
    }))
    .catch_unwind()
    .await;

    let payload = outcome.err().expect("the panic is resumed");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"exploded after cleanup"));
    assert!(exprec::listing::list_run_ids(&ws.root).await.unwrap().is_empty());
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let ws = Workspace::new();
    let (tx, mut rx) = tokio::sync::broadcast::channel(16);
    let opts = no_packages(ws.options("watched")).events(EventSink::new(tx));
    let mut run = Run::start(opts, StdStreams::sink()).await.unwrap();
    run.add_scalar("acc", 0.75, Some(1)).await.unwrap();
    let id = run.id_str().to_string();
    run.finish(Err(Failure::new("ValueError", "bad input"))).await.unwrap();

    let got: Vec<RunEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(got.len(), 3);
    assert!(matches!(&got[0], RunEvent::Started { name, .. } if name == "watched"));
    assert!(matches!(&got[1], RunEvent::Scalar { name, value, step: Some(1), .. } if name == "acc" && *value == 0.75));
    assert!(matches!(&got[2], RunEvent::Failed { kind, .. } if kind == "ValueError"));
    assert!(got.iter().all(|e| e.run_id() == id));
}

#[tokio::test]
async fn images_keep_one_file_per_step() {
    let ws = Workspace::new();
    let run = Run::start(no_packages(ws.options("")), StdStreams::sink()).await.unwrap();
    let img = |v: u8| DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([v, v, v])));
    run.add_image("samples", &img(10), 0).await.unwrap();
    run.add_image("samples", &img(20), 5).await.unwrap();
    run.add_image("samples", &img(30), 5).await.unwrap();
    assert!(matches!(run.add_image("../x", &img(0), 0).await, Err(ExprecError::PathTraversal(_))));

    let (step, latest) = latest_image(run.paths(), "samples").await.unwrap();
    assert_eq!(step, 5);
    assert_eq!(latest.to_rgb8().get_pixel(0, 0), &Rgb([30, 30, 30]));
    run.finish(Ok(())).await.unwrap();
}

#[tokio::test]
async fn files_written_by_a_run_read_back() {
    let ws = Workspace::new();
    let run = Run::start(no_packages(ws.options("")), StdStreams::sink()).await.unwrap();
    {
        let mut f = run.open_dependency("weights.bin", None).await.unwrap();
        f.write_all(&[1, 2, 3]).await.unwrap();
        f.flush().await.unwrap();
    }
    let mut buf = Vec::new();
    run.open_file("weights.bin").await.unwrap().read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, vec![1, 2, 3]);
    let rec = load_record(&run.paths().metadata()).await.unwrap();
    assert!(rec.file_dependencies.is_empty());
    run.finish(Ok(())).await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn scalar_series_keeps_every_append_in_order(
        points in prop::collection::vec((-1e6f64..1e6, prop::option::of(0u64..10_000)), 0..40)
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("scalars").join("loss.csv");
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let read = rt.block_on(async {
            let writer = ScalarWriter::open(path.clone()).await.unwrap();
            for (value, step) in &points {
                writer.append(*value, *step).await.unwrap();
            }
            drop(writer);
            // Reopening must not write a second header.
            ScalarWriter::open(path.clone()).await.unwrap();
            read_series(&path).await.unwrap()
        });

        prop_assert_eq!(read.len(), points.len());
        for (i, (p, (value, step))) in read.iter().zip(&points).enumerate() {
            prop_assert_eq!(p.index, i);
            prop_assert_eq!(p.value, *value);
            prop_assert_eq!(p.step, *step);
            prop_assert_eq!(p.x(), step.unwrap_or(i as u64));
        }
    }
}
