use engine_logging::{engine_info, engine_task_log, initialize, initialize_for_tests, LogDestination};
use log::LevelFilter;
use tempfile::TempDir;

#[test]
fn test_initializer_is_idempotent() {
    initialize_for_tests();
    initialize_for_tests();
    engine_info!("logger installed");
    engine_task_log!(log::Level::Info, "t-1", "task scoped {}", 42);
}

#[test]
fn file_destination_creates_the_log_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("engine.log");

    // A logger may already be installed by the other test; the file is still created.
    let _ = initialize(LevelFilter::Info, LogDestination::File(path.clone()));
    assert!(path.exists());
}

#[test]
fn unwritable_file_destination_reports_failure() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("missing").join("engine.log");

    assert!(!initialize(LevelFilter::Info, LogDestination::File(path.clone())));
    assert!(!path.exists());
}
