//! Integration tests for snapshot queries: checkout, file listing, globbing,
//! file metadata and blame summaries.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{AUTHOR, Change, EMAIL, FIRST_COMMIT_TIME, Fixture, OFFSET_MINUTES, SECOND_COMMIT_TIME};
use rstest::rstest;
use repo_cache::StoreError;

const MASTER_FILES: [&str; 7] = [
    "LICENSE",
    "README.md",
    "go/example.go",
    "json/short.json",
    "php/crappy.php",
    "scripts/run.sh",
    "vendor/foo.go",
];

#[tokio::test(flavor = "multi_thread")]
async fn lists_every_file_at_head() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let files = snapshot.get_all_files("", true).unwrap();
    let paths: Vec<&str> = files.keys().map(String::as_str).collect();
    assert_eq!(paths, MASTER_FILES);
    assert!(files.iter().all(|(path, file)| file.path() == path));
}

#[tokio::test(flavor = "multi_thread")]
async fn symlinks_are_listed_on_request() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let files = snapshot.get_all_files("", false).unwrap();
    assert_eq!(files.len(), MASTER_FILES.len() + 1);

    let link = &files["link-to-readme"];
    assert!(link.is_symlink());
    assert_eq!(link.contents(), "README.md");
    assert!(!files["README.md"].is_symlink());
}

#[rstest]
#[case("**/*.go", &["go/example.go", "vendor/foo.go"])]
#[case("vendor/*", &["vendor/foo.go"])]
#[case("*.md", &["README.md"])]
#[case("{**/*,*}.{json,php}", &["json/short.json", "php/crappy.php"])]
#[case("scripts/run.sh", &["scripts/run.sh"])]
#[case("nothing/**/*", &[])]
#[tokio::test(flavor = "multi_thread")]
async fn filters_by_glob(#[case] pattern: &str, #[case] expected: &[&str]) {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let files = snapshot.get_all_files(pattern, true).unwrap();
    let paths: Vec<&str> = files.keys().map(String::as_str).collect();
    assert_eq!(paths, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_glob_is_rejected() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let err = snapshot.get_all_files("go/{a,b", true).unwrap_err();
    assert!(matches!(err, StoreError::Glob { ref pattern, .. } if pattern == "go/{a,b"));
}

#[tokio::test(flavor = "multi_thread")]
async fn checkout_moves_between_branches_tags_and_hashes() {
    let (fixture, history) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    assert_eq!(snapshot.checkout("v1.0.0").unwrap(), history.first);
    assert!(snapshot.get_file("php/crappy.php").is_err());
    assert_eq!(snapshot.get_all_files("", true).unwrap().len(), MASTER_FILES.len() - 1);

    assert_eq!(snapshot.checkout("feature").unwrap(), history.feature);
    assert_eq!(snapshot.get_file("feature.txt").unwrap().contents(), "feature\n");

    let short = &history.second.to_string()[..10];
    assert_eq!(snapshot.checkout(short).unwrap(), history.second);

    assert_eq!(snapshot.checkout("refs/remotes/origin/feature").unwrap(), history.feature);
    assert_eq!(snapshot.checkout("origin/master").unwrap(), history.second);
}

#[tokio::test(flavor = "multi_thread")]
async fn checkout_is_idempotent() {
    let (fixture, history) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    assert_eq!(snapshot.checkout("master").unwrap(), history.second);
    assert_eq!(snapshot.checkout("master").unwrap(), history.second);
    assert_eq!(snapshot.head().unwrap(), history.second);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_revision_leaves_head_alone() {
    let (fixture, history) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let err = snapshot.checkout("does-not-exist").unwrap_err();
    assert!(matches!(err, StoreError::RefResolution { ref revision, .. } if revision == "does-not-exist"));
    assert_eq!(snapshot.head().unwrap(), history.second);
}

#[tokio::test(flavor = "multi_thread")]
async fn checkout_fetches_new_commits() {
    let (fixture, history) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;
    assert_eq!(snapshot.head().unwrap(), history.second);

    let third = fixture.commit(
        "master",
        "Add notes",
        SECOND_COMMIT_TIME + 3600,
        &[Change::Write("NOTES.md", "notes\n")],
    );
    fixture.tag("v2.0.0", third);

    assert_eq!(snapshot.checkout("master").unwrap(), third);
    assert_eq!(snapshot.get_file("NOTES.md").unwrap().contents(), "notes\n");
    assert_eq!(snapshot.resolve("v2.0.0").unwrap(), third);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_deadline_fails_fetch_and_keeps_head() {
    let (fixture, history) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;
    let third = fixture.commit(
        "master",
        "Add notes",
        SECOND_COMMIT_TIME + 3600,
        &[Change::Write("NOTES.md", "notes\n")],
    );

    let err = snapshot.fetch_with_deadline(Instant::now()).unwrap_err();
    assert!(matches!(err, StoreError::Fetch { .. }), "{err}");
    let err = snapshot.checkout_with_deadline("master", Instant::now()).unwrap_err();
    assert!(matches!(err, StoreError::Fetch { .. }), "{err}");
    assert_eq!(snapshot.head().unwrap(), history.second);

    let deadline = Instant::now() + Duration::from_secs(60);
    assert_eq!(snapshot.checkout_with_deadline("master", deadline).unwrap(), third);
}

#[tokio::test(flavor = "multi_thread")]
async fn checkout_discards_local_modifications() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;
    let readme = snapshot.path().unwrap().join("README.md");

    std::fs::write(&readme, "scribbled\n").unwrap();
    snapshot.checkout("master").unwrap();
    assert_eq!(std::fs::read_to_string(&readme).unwrap(), "# fixture\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn get_file_only_returns_files() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let readme = snapshot.get_file("README.md").unwrap();
    assert_eq!(readme.path(), "README.md");
    assert_eq!(readme.contents(), "# fixture\n");
    assert_eq!(readme.try_contents().unwrap(), "# fixture\n");

    for missing in ["go", "missing.txt", "go/missing.go"] {
        let err = snapshot.get_file(missing).unwrap_err();
        assert!(matches!(err, StoreError::PathNotFound { ref path } if path == missing));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn distinguishes_files_from_directories() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    assert!(snapshot.is_directory("go").unwrap());
    assert!(snapshot.is_directory("scripts").unwrap());
    assert!(!snapshot.is_directory("README.md").unwrap());

    assert!(snapshot.is_file("README.md").unwrap());
    assert!(snapshot.is_file("go/example.go").unwrap());
    assert!(!snapshot.is_file("go").unwrap());
    // Executables and symlinks are not regular files.
    assert!(!snapshot.is_file("scripts/run.sh").unwrap());
    assert!(!snapshot.is_file("link-to-readme").unwrap());

    assert!(matches!(
        snapshot.is_directory("missing").unwrap_err(),
        StoreError::PathNotFound { .. }
    ));
    assert!(snapshot.is_file("missing").is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn last_updated_keeps_commit_offset() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let updated = snapshot.last_updated().unwrap();
    assert_eq!(updated.timestamp(), SECOND_COMMIT_TIME);
    assert_eq!(updated.offset().local_minus_utc(), OFFSET_MINUTES * 60);
    assert_eq!(updated.to_rfc3339(), "2023-11-15T00:13:20+02:00");

    snapshot.checkout("v1.0.0").unwrap();
    assert_eq!(snapshot.last_updated().unwrap().timestamp(), FIRST_COMMIT_TIME);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_log_reports_newest_line() {
    let (fixture, history) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let example = snapshot.get_file("go/example.go").unwrap();
    let log = example.file_log().unwrap();
    assert_eq!(log.hash, history.second.to_string());
    assert_eq!(log.author, AUTHOR);
    assert_eq!(log.email, EMAIL);
    assert_eq!(log.message, "Add helper");
    assert_eq!(log.date.timestamp(), SECOND_COMMIT_TIME);
    assert_eq!(log.date.offset().local_minus_utc(), OFFSET_MINUTES * 60);

    let readme = snapshot.get_file("README.md").unwrap();
    let log = readme.file_log().unwrap();
    assert_eq!(log.hash, history.first.to_string());
    assert_eq!(log.message, "Initial commit");
}

#[tokio::test(flavor = "multi_thread")]
async fn file_log_is_empty_for_empty_files() {
    let fixture = Fixture::new();
    fixture.commit(
        "master",
        "Add empty file",
        FIRST_COMMIT_TIME,
        &[Change::Write("empty", ""), Change::Write("full", "line\n")],
    );
    let snapshot = common::snapshot(&fixture).await;

    assert_eq!(snapshot.get_file("empty").unwrap().file_log(), None);
    assert!(snapshot.get_file("full").unwrap().file_log().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn handles_stay_pinned_across_checkouts() {
    let (fixture, history) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    let example = snapshot.get_file("go/example.go").unwrap();
    assert_eq!(example.commit(), history.second);

    snapshot.checkout("v1.0.0").unwrap();
    assert!(example.contents().contains("helper"));
    assert_eq!(example.file_log().unwrap().hash, history.second.to_string());

    let older = snapshot.get_file("go/example.go").unwrap();
    assert!(!older.contents().contains("helper"));
    assert_eq!(older.file_log().unwrap().hash, history.first.to_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn binary_contents_read_as_empty_text() {
    let fixture = Fixture::new();
    fixture.commit(
        "master",
        "Add blobs",
        FIRST_COMMIT_TIME,
        &[
            Change::Write("text.txt", "plain\n"),
            Change::Bytes("binary.bin", &[0xff, 0xfe, 0x00]),
        ],
    );
    let snapshot = common::snapshot(&fixture).await;

    let binary = snapshot.get_file("binary.bin").unwrap();
    assert_eq!(binary.bytes().unwrap(), [0xff, 0xfe, 0x00]);
    assert_eq!(binary.contents(), "");
    assert!(matches!(binary.try_contents().unwrap_err(), StoreError::Content { .. }));

    let text = snapshot.get_file("text.txt").unwrap();
    assert_eq!(text.bytes().unwrap(), b"plain\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn untracked_files_are_invisible() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;

    std::fs::write(snapshot.path().unwrap().join("scratch.txt"), "local\n").unwrap();
    assert!(snapshot.get_file("scratch.txt").is_err());
    assert!(!snapshot.get_all_files("", true).unwrap().contains_key("scratch.txt"));
}

#[tokio::test(flavor = "multi_thread")]
async fn readers_never_observe_a_half_checkout() {
    let (fixture, _) = Fixture::standard();
    let snapshot = common::snapshot(&fixture).await;
    let expected: HashSet<usize> = [MASTER_FILES.len(), MASTER_FILES.len() - 1].into();

    let writer = {
        let snapshot = Arc::clone(&snapshot);
        thread::spawn(move || {
            for revision in ["v1.0.0", "master", "v1.0.0", "master"] {
                snapshot.checkout(revision).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let snapshot = Arc::clone(&snapshot);
            thread::spawn(move || {
                (0..20)
                    .map(|_| snapshot.get_all_files("", true).unwrap().len())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        for count in reader.join().unwrap() {
            assert!(expected.contains(&count), "unexpected listing of {count} files");
        }
    }
}
