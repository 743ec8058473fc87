use std::io::Write;
use std::time::Duration;

use tailmux::{Line, TailMux};
use tempfile::tempdir;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn next_line(mux: &mut TailMux) -> Line {
    timeout(WAIT, mux.next_line())
        .await
        .expect("timed out waiting for a line")
        .expect("line stream failed")
        .expect("line stream ended")
}

fn append(path: &std::path::Path, bytes: &[u8]) {
    let mut fh = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    fh.write_all(bytes).unwrap();
    fh.sync_all().unwrap();
}

#[tokio::test]
async fn test_logrotate_reads_replacement_from_start() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("log.txt");
    std::fs::write(&logfile, b"").unwrap();

    let mut mux = TailMux::new().unwrap();
    let source = mux.add_file(&logfile).await.unwrap();

    append(&logfile, b"pre-rotation\n");
    assert_eq!(next_line(&mut mux).await.text(), "pre-rotation");

    // Classic move-onto-path rotation: a fully written file replaces the
    // watched one.
    let staged = logdir.path().join("log2.txt");
    std::fs::write(&staged, b"y\n").unwrap();
    std::fs::rename(&staged, &logfile).unwrap();

    let line = next_line(&mut mux).await;
    assert_eq!(line.source(), source);
    assert_eq!(line.text(), "y");

    // The refreshed watch keeps following the replacement file.
    append(&logfile, b"post-rotation\n");
    let line = next_line(&mut mux).await;
    assert_eq!(line.source(), source);
    assert_eq!(line.text(), "post-rotation");
}

#[tokio::test]
async fn test_truncate_rewrite_emits_no_partial_data() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("log.txt");
    std::fs::write(&logfile, b"").unwrap();

    let mut mux = TailMux::new().unwrap();
    let source = mux.add_file(&logfile).await.unwrap();

    append(&logfile, b"a considerably longer line\n");
    assert_eq!(
        next_line(&mut mux).await.text(),
        "a considerably longer line"
    );

    // In-place truncate-and-rewrite, same path and identity.
    std::fs::write(&logfile, b"z\n").unwrap();

    let line = next_line(&mut mux).await;
    assert_eq!(line.source(), source);
    assert_eq!(line.text(), "z");
}

#[tokio::test]
async fn test_two_files_keep_per_file_order() {
    let logdir = tempdir().unwrap();
    let file_a = logdir.path().join("a.log");
    let file_b = logdir.path().join("b.log");
    std::fs::write(&file_a, b"").unwrap();
    std::fs::write(&file_b, b"").unwrap();

    let mut mux = TailMux::new().unwrap();
    let source_a = mux.add_file(&file_a).await.unwrap();
    let source_b = mux.add_file(&file_b).await.unwrap();

    for (path, text) in [
        (&file_a, "a1\n"),
        (&file_b, "b1\n"),
        (&file_a, "a2\n"),
        (&file_b, "b2\n"),
    ] {
        append(path, text.as_bytes());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut from_a = Vec::new();
    let mut from_b = Vec::new();
    for _ in 0..4 {
        let line = next_line(&mut mux).await;
        if line.source() == source_a {
            from_a.push(line.text().to_string());
        } else {
            assert_eq!(line.source(), source_b);
            from_b.push(line.text().to_string());
        }
    }

    assert_eq!(from_a, vec!["a1".to_string(), "a2".to_string()]);
    assert_eq!(from_b, vec!["b1".to_string(), "b2".to_string()]);
}
